//! # Cohort size guard
//!
//! Before an aggregate runs, the guard counts the distinct subjects the
//! (rewritten) query touches, per group, and blocks the query when any group is
//! smaller than the configured minimum. Only the verdict leaves this module.
//!

use crate::{
    config::DEFAULT_MIN_COHORT_SIZE,
    io::{self, Store, Value},
    schema::Schema,
    sql::{AggregateFunction, Expr, Function, Query, SelectItem},
};
use std::{error, fmt, result, sync::Arc};

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Execution(String),
    Other(String),
}

impl Error {
    pub fn execution(desc: impl fmt::Display) -> Error {
        Error::Execution(format!("Cohort query failed: {}", desc))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Execution(desc) => writeln!(f, "Execution: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::execution(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

pub const COHORT_SIZE: &str = "cohort_size";

#[derive(Clone)]
pub struct CohortGuard {
    store: Arc<dyn Store>,
    schema: Schema,
    min_cohort_size: u64,
}

impl CohortGuard {
    pub fn new(store: Arc<dyn Store>, schema: Schema, min_cohort_size: u64) -> Self {
        CohortGuard {
            store,
            schema,
            min_cohort_size,
        }
    }

    pub fn min_cohort_size(&self) -> u64 {
        self.min_cohort_size
    }

    /// Same table, filter and grouping, projecting the distinct subjects
    pub fn cohort_query(&self, query: &Query) -> Query {
        let subject_id = self.schema.subject_id(query.table());
        query.clone().with_projection(vec![SelectItem::aliased(
            Expr::function(Function::aggregate(
                AggregateFunction::Count,
                true,
                Expr::column(subject_id),
            )),
            COHORT_SIZE,
        )])
    }

    /// `true` when the query must be blocked
    pub fn check_cohort_violation(&self, query: &Query) -> Result<bool> {
        let cohort_query = self.cohort_query(query);
        let rows = self.store.query(&cohort_query.to_string())?;
        if rows.is_empty() {
            log::debug!("Empty cohort");
            return Ok(true);
        }
        let threshold = self.min_cohort_size as f64;
        let violation = rows.iter().any(|row| {
            !matches!(row.value(0).and_then(Value::as_f64), Some(size) if size >= threshold)
        });
        if violation {
            log::debug!("Cohort below threshold");
        }
        Ok(violation)
    }
}

impl fmt::Debug for CohortGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortGuard")
            .field("min_cohort_size", &self.min_cohort_size)
            .finish()
    }
}

/// A guard with the default threshold over the hospital schema
pub fn default_guard(store: Arc<dyn Store>) -> CohortGuard {
    CohortGuard::new(store, Schema::hospital(), DEFAULT_MIN_COHORT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{sqlite::test_database, Row};

    #[test]
    fn test_cohort_query() -> crate::sql::Result<()> {
        let guard = default_guard(Arc::new(test_database()));
        for (query, expected) in [
            (
                "SELECT SUM(age) FROM patients WHERE age >= 60 GROUP BY gender",
                "SELECT COUNT(DISTINCT patient_id) AS cohort_size FROM patients WHERE age >= 60 GROUP BY gender",
            ),
            (
                "SELECT COUNT(*) FROM diagnoses WHERE disease_name = 'Flu'",
                "SELECT COUNT(DISTINCT patient_id) AS cohort_size FROM diagnoses WHERE disease_name = 'Flu'",
            ),
            (
                "SELECT AVG(privacy_budget) FROM staffs",
                "SELECT COUNT(DISTINCT staff_id) AS cohort_size FROM staffs",
            ),
        ] {
            let cohort_query = guard.cohort_query(&Query::parse(query)?);
            println!("{cohort_query}");
            assert_eq!(cohort_query.to_string(), expected);
        }
        Ok(())
    }

    #[test]
    fn test_check_cohort_violation() -> Result<()> {
        let guard = default_guard(Arc::new(test_database()));
        for (query, blocked) in [
            ("SELECT COUNT(*) FROM patients WHERE age >= 40 AND age < 50", false),
            ("SELECT COUNT(*) FROM patients WHERE age < 10", true),
            ("SELECT COUNT(*) FROM patients WHERE age > 200", true),
            ("SELECT COUNT(*) FROM patients GROUP BY gender", false),
            ("SELECT COUNT(*) FROM patients GROUP BY address", true),
            ("SELECT COUNT(*) FROM patients WHERE age > 200 GROUP BY gender", true),
            ("SELECT COUNT(*) FROM diagnoses WHERE disease_name = 'Flu'", false),
            ("SELECT COUNT(*) FROM staffs", true),
        ] {
            let violation = guard.check_cohort_violation(&Query::parse(query).unwrap())?;
            println!("{query} => {violation}");
            assert_eq!(violation, blocked);
        }
        Ok(())
    }

    struct FixedRows(Vec<Row>);

    impl Store for FixedRows {
        fn execute(&self, _sql: &str, _params: &[Value]) -> io::Result<Vec<Row>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Store for Failing {
        fn execute(&self, _sql: &str, _params: &[Value]) -> io::Result<Vec<Row>> {
            Err(io::Error::database("unavailable"))
        }
    }

    #[test]
    fn test_fail_closed() {
        let query = Query::parse("SELECT COUNT(*) FROM patients").unwrap();
        let non_numeric = Row::new(vec![(COHORT_SIZE.to_string(), Value::text("many"))]);
        let guard = default_guard(Arc::new(FixedRows(vec![non_numeric])));
        assert_eq!(guard.check_cohort_violation(&query), Ok(true));
        let null = Row::new(vec![(COHORT_SIZE.to_string(), Value::Null)]);
        let guard = default_guard(Arc::new(FixedRows(vec![null])));
        assert_eq!(guard.check_cohort_violation(&query), Ok(true));
        let exact = Row::new(vec![(COHORT_SIZE.to_string(), Value::Integer(10))]);
        let guard = default_guard(Arc::new(FixedRows(vec![exact])));
        assert_eq!(guard.check_cohort_violation(&query), Ok(false));
        let guard = default_guard(Arc::new(Failing));
        assert!(matches!(
            guard.check_cohort_violation(&query),
            Err(Error::Execution(_))
        ));
    }
}
