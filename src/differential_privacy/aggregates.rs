//! Planning and release of a single aggregate, possibly grouped.

use super::{
    calculate_sensitivity, post_process, Bounds, Error, LaplaceMechanism, QueryType, Result,
};
use crate::{
    config::Config,
    io::{Row, Value},
    schema::Schema,
    sql::{AggregateFunction, Expr, Function, Query, SelectItem},
};
use std::fmt;

/// One released value with the keys of its group
#[derive(Clone, Debug, PartialEq)]
pub struct NoisyRow {
    pub group: Vec<(String, Value)>,
    pub value: f64,
}

impl fmt::Display for NoisyRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (column, value) in &self.group {
            write!(f, "{column}: {value}, ")?;
        }
        write!(f, "{}", self.value)
    }
}

/// How an aggregate query is executed and noised
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatePlan {
    query_type: QueryType,
    column: Option<String>,
    bounds: Option<Bounds>,
    sensitivity: f64,
    query: Query,
}

impl AggregatePlan {
    /// Check the shape of the query and derive its sensitivity
    pub fn new(query: &Query, config: &Config) -> Result<AggregatePlan> {
        let query_type = QueryType::detect(query);
        let (first, keys) = match query.projection().split_first() {
            Some(split) => split,
            None => return Err(Error::unsupported_query_type("an empty projection")),
        };
        let (aggregate, function) = first
            .expr()
            .as_aggregate()
            .ok_or_else(|| Error::unsupported_query_type(first))?;
        let column = match function.args() {
            [Expr::Wildcard] if aggregate == AggregateFunction::Count && !function.distinct() => {
                None
            }
            [Expr::Column(column)] if aggregate == AggregateFunction::Count || !function.distinct() => {
                Some(column.clone())
            }
            _ => return Err(Error::unsupported_query_type(first)),
        };
        for key in keys {
            match key.expr() {
                Expr::Column(column) if query.group_by().contains(column) => {}
                _ => {
                    return Err(Error::unsupported_query_type(format!(
                        "{key} is not a grouping column"
                    )))
                }
            }
        }
        let bounds = match (query_type, &column) {
            (QueryType::Count, _) => None,
            (_, Some(column)) => {
                let (lower, upper) = config
                    .bounds(column)
                    .ok_or_else(|| Error::missing_bounds(column))?;
                Some(Bounds::new(lower, upper)?)
            }
            (_, None) => return Err(Error::unsupported_query_type(first)),
        };
        let sensitivity = match query_type {
            QueryType::Avg => calculate_sensitivity(QueryType::Sum, bounds)?,
            query_type => calculate_sensitivity(query_type, bounds)?,
        };
        let query = match (query_type, &column) {
            (QueryType::Avg, Some(column)) => {
                let mut projection = vec![
                    SelectItem::aliased(
                        Expr::function(Function::aggregate(
                            AggregateFunction::Sum,
                            false,
                            Expr::column(column.as_str()),
                        )),
                        "sum",
                    ),
                    SelectItem::aliased(
                        Expr::function(Function::aggregate(
                            AggregateFunction::Count,
                            false,
                            Expr::column(column.as_str()),
                        )),
                        "count",
                    ),
                ];
                projection.extend(keys.iter().cloned());
                query.clone().with_projection(projection)
            }
            _ => query.clone(),
        };
        Ok(AggregatePlan {
            query_type,
            column,
            bounds,
            sensitivity,
            query,
        })
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// The sensitivity of the released aggregate (of the sum, for an average)
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// The query to execute
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Number of leading aggregate columns in an executed row
    fn aggregate_width(&self) -> usize {
        match self.query_type {
            QueryType::Avg => 2,
            _ => 1,
        }
    }

    /// Noise every row with the full epsilon, groups being disjoint
    pub fn release(
        &self,
        rows: &[Row],
        mechanism: &LaplaceMechanism,
        epsilon: f64,
        schema: &Schema,
    ) -> Result<Vec<NoisyRow>> {
        rows.iter()
            .map(|row| {
                let noisy = match self.query_type {
                    QueryType::Avg => {
                        let half = epsilon / 2.;
                        let noisy_sum =
                            mechanism.add_noise(number(row, 0)?, self.sensitivity, half)?;
                        let noisy_count = mechanism.add_noise(number(row, 1)?, 1., half)?;
                        if noisy_count < 1. {
                            0.
                        } else {
                            noisy_sum / noisy_count
                        }
                    }
                    _ => mechanism.add_noise(number(row, 0)?, self.sensitivity, epsilon)?,
                };
                Ok(NoisyRow {
                    group: row.columns().skip(self.aggregate_width()).cloned().collect(),
                    value: post_process(noisy, self.query_type, self.column(), schema),
                })
            })
            .collect()
    }
}

/// The numeric value of an aggregate column, NULL being an empty aggregate
fn number(row: &Row, index: usize) -> Result<f64> {
    match row.value(index) {
        Some(Value::Null) => Ok(0.),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| Error::other("the aggregate is not numeric")),
        None => Err(Error::other("the aggregate is missing from the result")),
    }
}
