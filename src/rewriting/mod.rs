//! # Query rewriting
//!
//! Validated queries go through two AST-to-AST passes, always in this order:
//! sensitive comparisons are generalized to 10-wide buckets, then queries
//! without an aggregate are turned into a count.
//!

pub mod aggregation;
pub mod generalization;

use crate::{schema::Schema, sql::Query, validation::ValidatedQuery};

pub use aggregation::enforce_aggregation;
pub use generalization::{ceil10, floor10, Generalizer};

#[derive(Clone, Debug, Default)]
pub struct Rewriter {
    schema: Schema,
}

impl Rewriter {
    pub fn new(schema: Schema) -> Self {
        Rewriter { schema }
    }

    /// Generalize the filter, then enforce aggregation
    pub fn rewrite(&self, query: ValidatedQuery) -> Query {
        let query = self.generalize(query.into_query());
        let query = enforce_aggregation(query);
        log::debug!("Rewritten query: {query}");
        query
    }

    pub fn generalize(&self, query: Query) -> Query {
        let filter = query
            .filter()
            .map(|filter| Generalizer::new(&self.schema).generalize(filter));
        query.with_filter(filter)
    }
}
