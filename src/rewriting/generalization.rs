//! Generalization of comparisons on sensitive attributes to 10-wide buckets.

use crate::{
    schema::Schema,
    sql::{ComparisonOp, Expr, Function, Literal, Visitor},
};
use sqlparser::ast;

/// Width of a generalization bucket
pub const BUCKET_WIDTH: i64 = 10;

/// Largest bucket boundary not above `value`, `None` when it does not fit an `i64`
pub fn floor10(value: i64) -> Option<i64> {
    value.div_euclid(BUCKET_WIDTH).checked_mul(BUCKET_WIDTH)
}

/// Smallest bucket boundary not below `value`, `None` when it does not fit an `i64`
pub fn ceil10(value: i64) -> Option<i64> {
    value
        .checked_add(BUCKET_WIDTH - 1)?
        .div_euclid(BUCKET_WIDTH)
        .checked_mul(BUCKET_WIDTH)
}

/// Rebuilds an expression with every `sensitive OP integer` comparison widened
pub struct Generalizer<'s> {
    schema: &'s Schema,
}

impl<'s> Generalizer<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Generalizer { schema }
    }

    pub fn generalize(&self, expr: &Expr) -> Expr {
        expr.accept(self)
    }

    fn bucket(&self, column: &str, op: ComparisonOp, value: i64) -> Option<Expr> {
        let col = || Expr::column(column);
        Some(match op {
            ComparisonOp::Eq => {
                let lower = floor10(value)?;
                Expr::and(
                    Expr::comparison(col(), ComparisonOp::GtEq, Expr::integer(lower)),
                    Expr::comparison(
                        col(),
                        ComparisonOp::Lt,
                        Expr::integer(lower.checked_add(BUCKET_WIDTH)?),
                    ),
                )
            }
            ComparisonOp::Lt => Expr::comparison(col(), ComparisonOp::Lt, Expr::integer(ceil10(value)?)),
            ComparisonOp::LtEq => Expr::comparison(col(), ComparisonOp::Lt, Expr::integer(ceil10(value)?)),
            ComparisonOp::Gt | ComparisonOp::GtEq => {
                Expr::comparison(col(), ComparisonOp::GtEq, Expr::integer(floor10(value)?))
            }
            ComparisonOp::NotEq => return None,
        })
    }
}

/// The operand inside any parentheses, `((age))` is `age`
fn unnested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unnested(inner),
        expr => expr,
    }
}

/// The operator seen from the other side (`3 < age` is `age > 3`)
fn flip(op: ComparisonOp) -> ComparisonOp {
    match op {
        ComparisonOp::Lt => ComparisonOp::Gt,
        ComparisonOp::LtEq => ComparisonOp::GtEq,
        ComparisonOp::Gt => ComparisonOp::Lt,
        ComparisonOp::GtEq => ComparisonOp::LtEq,
        op => op,
    }
}

impl<'a, 's> Visitor<'a, Expr> for Generalizer<'s> {
    fn column(&self, name: &'a str) -> Expr {
        Expr::column(name)
    }

    fn literal(&self, literal: &'a Literal) -> Expr {
        Expr::Literal(literal.clone())
    }

    fn wildcard(&self) -> Expr {
        Expr::Wildcard
    }

    fn comparison(&self, left: Expr, op: ComparisonOp, right: Expr) -> Expr {
        let generalized = match (unnested(&left), unnested(&right)) {
            (Expr::Column(column), Expr::Literal(literal)) if self.schema.is_sensitive(column) => {
                literal
                    .as_integer()
                    .and_then(|value| self.bucket(column, op, value))
            }
            (Expr::Literal(literal), Expr::Column(column)) if self.schema.is_sensitive(column) => {
                literal
                    .as_integer()
                    .and_then(|value| self.bucket(column, flip(op), value))
            }
            _ => None,
        };
        generalized.unwrap_or_else(|| Expr::comparison(left, op, right))
    }

    fn and(&self, left: Expr, right: Expr) -> Expr {
        Expr::and(left, right)
    }

    fn or(&self, left: Expr, right: Expr) -> Expr {
        Expr::or(left, right)
    }

    fn nested(&self, expr: Expr) -> Expr {
        Expr::nested(expr)
    }

    fn function(&self, function: &'a Function, args: Vec<Expr>) -> Expr {
        Expr::function(Function::new(function.name(), function.distinct(), args))
    }

    fn other(&self, expr: &'a ast::Expr) -> Expr {
        Expr::Other(Box::new(expr.clone()))
    }
}
