//! # Privacy-preserving SQL middleware for a hospital database
//!
//! Analysts send SQL aggregate queries; the middleware answers them without
//! revealing anything about a small group or a single individual beyond a
//! bounded, per-analyst privacy loss.
//!
//! ## How a query is answered
//! A query is parsed and lowered into a small closed AST, checked against the
//! analyst's role policy, and rewritten: comparisons on sensitive attributes
//! are widened to 10-wide buckets and non-aggregate queries become counts.
//! Queries touching fewer than `k` distinct individuals are refused. The
//! remaining aggregates are released with Laplace noise calibrated to their
//! sensitivity, and the analyst's epsilon budget is charged.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use hospital_privacy::{config::Config, io::sqlite::SqliteStore, pipeline::Pipeline};
//! let store = Arc::new(SqliteStore::open("hospital.db").unwrap());
//! let pipeline = Pipeline::with_store(store, Config::default()).unwrap();
//! let response = pipeline
//!     .process("SELECT COUNT(*) FROM patients WHERE age = 63", "001080000001", 1.0)
//!     .unwrap();
//! println!("{:?}", response.result_value());
//! ```
//!

pub mod budget;
pub mod cohort;
pub mod config;
pub mod differential_privacy;
pub mod io;
pub mod pipeline;
pub mod policy;
pub mod rewriting;
pub mod schema;
pub mod setup;
pub mod sql;
pub mod validation;

pub use budget::{BudgetLedger, Reservation};
pub use config::Config;
pub use pipeline::{Pipeline, QueryResponse};
pub use policy::{Role, RolePolicy};
/// Expose sqlparser::ast as part of the crate
pub use sqlparser::{ast, dialect, parser, tokenizer};
