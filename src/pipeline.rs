//! # The query-processing pipeline
//!
//! [`Pipeline::process`] runs every stage in a fixed order and aborts the
//! request with a typed error at the first failure:
//! identity lookup, validation, budget reservation, rewriting, cohort check,
//! execution, noise and post-processing, and finally the budget commit.
//!

use crate::{
    budget::{self, BudgetCommitter, BudgetLedger},
    cohort::{self, CohortGuard},
    config::Config,
    differential_privacy::{self, AggregatePlan, LaplaceMechanism, NoisyRow, QueryType},
    io::{self, Store},
    policy::{self, Directory},
    rewriting::Rewriter,
    schema::Schema,
    validation::{self, Validator},
};
use std::{error, fmt, result, sync::Arc};

// Error management

pub const PRIVACY_VIOLATION: &str = "Query violates cohort size requirements.";

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid syntax or a query the role may not run
    Security(String),
    BudgetExhausted { requested: f64, remaining: f64 },
    PrivacyViolation(String),
    UnsupportedQueryType(String),
    InvalidEpsilon(f64),
    Execution(String),
}

impl Error {
    pub fn security(desc: impl fmt::Display) -> Error {
        Error::Security(desc.to_string())
    }
    pub fn privacy_violation() -> Error {
        Error::PrivacyViolation(PRIVACY_VIOLATION.to_string())
    }
    pub fn unsupported_query_type(desc: impl fmt::Display) -> Error {
        Error::UnsupportedQueryType(desc.to_string())
    }
    pub fn execution(desc: impl fmt::Display) -> Error {
        Error::Execution(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Security(desc) => writeln!(f, "SecurityError: {}", desc),
            Error::BudgetExhausted {
                requested,
                remaining,
            } => writeln!(
                f,
                "BudgetExhausted: requested {requested}, remaining {remaining}"
            ),
            Error::PrivacyViolation(desc) => writeln!(f, "PrivacyViolation: {}", desc),
            Error::UnsupportedQueryType(desc) => writeln!(f, "UnsupportedQueryType: {}", desc),
            Error::InvalidEpsilon(epsilon) => writeln!(f, "InvalidEpsilon: {}", epsilon),
            Error::Execution(desc) => writeln!(f, "ExecutionError: {}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<validation::Error> for Error {
    fn from(err: validation::Error) -> Self {
        match err {
            validation::Error::Syntax(desc) | validation::Error::Security(desc) => {
                Error::Security(desc)
            }
        }
    }
}

impl From<budget::Error> for Error {
    fn from(err: budget::Error) -> Self {
        match err {
            budget::Error::BudgetExhausted {
                requested,
                remaining,
            } => Error::BudgetExhausted {
                requested,
                remaining,
            },
            budget::Error::InvalidCost(cost) => Error::InvalidEpsilon(cost),
            err => Error::execution(err),
        }
    }
}

impl From<differential_privacy::Error> for Error {
    fn from(err: differential_privacy::Error) -> Self {
        match err {
            differential_privacy::Error::UnsupportedQueryType(desc)
            | differential_privacy::Error::MissingBounds(desc)
            | differential_privacy::Error::InvalidBounds(desc) => Error::UnsupportedQueryType(desc),
            differential_privacy::Error::InvalidEpsilon(epsilon) => Error::InvalidEpsilon(epsilon),
            err => Error::execution(err),
        }
    }
}

impl From<cohort::Error> for Error {
    fn from(err: cohort::Error) -> Self {
        Error::execution(err)
    }
}

impl From<policy::Error> for Error {
    fn from(err: policy::Error) -> Self {
        Error::execution(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::execution(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// What the analyst gets back
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResponse {
    /// The rewritten query as executed
    pub executed_query: String,
    pub rows: Vec<NoisyRow>,
    pub epsilon_used: f64,
    pub query_type: QueryType,
}

impl QueryResponse {
    /// The released value of the first (or only) group
    pub fn result_value(&self) -> Option<f64> {
        self.rows.first().map(|row| row.value)
    }
}

impl fmt::Display for QueryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (ε = {})", self.executed_query, self.epsilon_used)?;
        for row in &self.rows {
            writeln!(f, "{row}")?;
        }
        Ok(())
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    config: Config,
    schema: Schema,
    directory: Directory,
    validator: Validator,
    rewriter: Rewriter,
    guard: CohortGuard,
    ledger: BudgetLedger,
    mechanism: LaplaceMechanism,
    committer: Option<BudgetCommitter>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, ledger: BudgetLedger, config: Config) -> Result<Self> {
        let schema = Schema::hospital();
        let mechanism = match config.noise_seed {
            Some(seed) => LaplaceMechanism::seeded(seed),
            None => LaplaceMechanism::new(),
        };
        let committer = if config.deferred_commit {
            Some(BudgetCommitter::spawn()?)
        } else {
            None
        };
        Ok(Pipeline {
            directory: Directory::new(store.clone()),
            validator: Validator::new(schema.clone()),
            rewriter: Rewriter::new(schema.clone()),
            guard: CohortGuard::new(store.clone(), schema.clone(), config.min_cohort_size),
            store,
            config,
            schema,
            ledger,
            mechanism,
            committer,
        })
    }

    /// A pipeline whose ledger shares the store
    pub fn with_store(store: Arc<dyn Store>, config: Config) -> Result<Self> {
        let ledger = BudgetLedger::new(store.clone());
        Pipeline::new(store, ledger, config)
    }

    pub fn with_mechanism(self, mechanism: LaplaceMechanism) -> Self {
        Pipeline { mechanism, ..self }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Answer a query for a principal, spending `epsilon` of their budget on success
    pub fn process(&self, sql: &str, principal: &str, epsilon: f64) -> Result<QueryResponse> {
        if !(epsilon.is_finite() && epsilon > 0.) {
            return Err(Error::InvalidEpsilon(epsilon));
        }
        let role = self.directory.lookup(principal)?;
        let validated = self.validator.validate(sql, &role.policy()).map_err(|err| {
            log::warn!("Query refused for the {role} role: {}", err.to_string().trim_end());
            err
        })?;
        let reservation = self.ledger.reserve(principal, epsilon)?;
        let rewritten = self.rewriter.rewrite(validated);
        if self.guard.check_cohort_violation(&rewritten)? {
            log::info!("Query blocked by the cohort guard");
            return Err(Error::privacy_violation());
        }
        let plan = AggregatePlan::new(&rewritten, &self.config)?;
        let executed_query = plan.query().to_string();
        let rows = self.store.query(&executed_query)?;
        let released = plan.release(&rows, &self.mechanism, epsilon, &self.schema)?;
        match &self.committer {
            Some(committer) => committer.submit(reservation)?,
            None => reservation.commit()?,
        }
        log::info!(
            "Released a noisy {} over {} group(s), spending {epsilon}",
            plan.query_type(),
            released.len()
        );
        Ok(QueryResponse {
            executed_query: rewritten.to_string(),
            rows: released,
            epsilon_used: epsilon,
            query_type: plan.query_type(),
        })
    }

    /// Wait for deferred budget commits to land
    pub fn flush(&self) -> Result<()> {
        match &self.committer {
            Some(committer) => Ok(committer.flush()?),
            None => Ok(()),
        }
    }
}
