//! # Differentially private release of aggregates
//!
//! The engine detects which aggregate a query computes, derives its global
//! sensitivity from public column bounds, and perturbs the true value with the
//! Laplace mechanism before post-processing it.
//!

pub mod aggregates;
pub mod mechanisms;

use crate::{schema::Schema, sql::Query};
use std::{error, fmt, result};

pub use aggregates::{AggregatePlan, NoisyRow};
pub use mechanisms::LaplaceMechanism;

#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    UnsupportedQueryType(String),
    MissingBounds(String),
    InvalidBounds(String),
    InvalidEpsilon(f64),
    InvalidSensitivity(f64),
    Other(String),
}

impl Error {
    pub fn unsupported_query_type(desc: impl fmt::Display) -> Error {
        Error::UnsupportedQueryType(format!("Unsupported query type: {desc}"))
    }
    pub fn missing_bounds(column: impl fmt::Display) -> Error {
        Error::MissingBounds(format!("No bounds are configured for {column}"))
    }
    pub fn invalid_bounds(lower: f64, upper: f64) -> Error {
        Error::InvalidBounds(format!("[{lower}, {upper}] are not valid bounds"))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedQueryType(desc) => writeln!(f, "UnsupportedQueryType: {}", desc),
            Error::MissingBounds(desc) => writeln!(f, "MissingBounds: {}", desc),
            Error::InvalidBounds(desc) => writeln!(f, "InvalidBounds: {}", desc),
            Error::InvalidEpsilon(epsilon) => writeln!(f, "InvalidEpsilon: {}", epsilon),
            Error::InvalidSensitivity(sensitivity) => {
                writeln!(f, "InvalidSensitivity: {}", sensitivity)
            }
            Error::Other(err) => writeln!(f, "{}", err),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// The aggregate a query releases
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum QueryType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Unknown,
}

impl QueryType {
    /// Detected from the first output expression, aliased or not
    pub fn detect(query: &Query) -> QueryType {
        use crate::sql::AggregateFunction;
        match query
            .projection()
            .first()
            .and_then(|item| item.expr().as_aggregate())
        {
            Some((AggregateFunction::Count, _)) => QueryType::Count,
            Some((AggregateFunction::Sum, _)) => QueryType::Sum,
            Some((AggregateFunction::Avg, _)) => QueryType::Avg,
            Some((AggregateFunction::Min, _)) => QueryType::Min,
            Some((AggregateFunction::Max, _)) => QueryType::Max,
            None => QueryType::Unknown,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryType::Count => "COUNT",
            QueryType::Sum => "SUM",
            QueryType::Avg => "AVG",
            QueryType::Min => "MIN",
            QueryType::Max => "MAX",
            QueryType::Unknown => "UNKNOWN",
        })
    }
}

/// The public range of a column
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    lower: f64,
    upper: f64,
}

impl Bounds {
    pub fn new(lower: f64, upper: f64) -> Result<Bounds> {
        if lower.is_finite() && upper.is_finite() && lower <= upper {
            Ok(Bounds { lower, upper })
        } else {
            Err(Error::invalid_bounds(lower, upper))
        }
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Global sensitivity: 1 for COUNT, the bounds width for SUM, MIN and MAX
pub fn calculate_sensitivity(query_type: QueryType, bounds: Option<Bounds>) -> Result<f64> {
    match query_type {
        QueryType::Count => Ok(1.),
        QueryType::Sum | QueryType::Min | QueryType::Max => bounds
            .map(|bounds| bounds.width())
            .ok_or_else(|| Error::missing_bounds(query_type)),
        QueryType::Avg | QueryType::Unknown => Err(Error::unsupported_query_type(format!(
            "no direct sensitivity for {query_type}"
        ))),
    }
}

/// Clamp to non-negative values, round counts and aggregates of integer columns
pub fn post_process(noisy: f64, query_type: QueryType, column: Option<&str>, schema: &Schema) -> f64 {
    let clamped = noisy.max(0.);
    match query_type {
        QueryType::Count => clamped.round(),
        QueryType::Sum | QueryType::Min | QueryType::Max
            if column.map_or(false, |column| schema.is_integer(column)) =>
        {
            clamped.round()
        }
        _ => clamped,
    }
}
