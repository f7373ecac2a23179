//! Type checking of filter predicates.
//!
//! A predicate may only combine columns and literals with comparison
//! operators, `AND`, `OR` and parentheses. Anything else is refused.

use super::{Error, Result};
use crate::sql::{ComparisonOp, Expr, Function, Literal, Visitor};
use sqlparser::ast;

/// What a sub-expression of a predicate evaluates to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Column,
    Literal,
    Condition,
}

/// Checks the shape of a predicate bottom-up
pub struct PredicateValidator;

impl<'a> Visitor<'a, Result<Operand>> for PredicateValidator {
    fn column(&self, _name: &'a str) -> Result<Operand> {
        Ok(Operand::Column)
    }

    fn literal(&self, _literal: &'a Literal) -> Result<Operand> {
        Ok(Operand::Literal)
    }

    fn wildcard(&self) -> Result<Operand> {
        Err(Error::security("'*' is not allowed in predicates"))
    }

    fn comparison(
        &self,
        left: Result<Operand>,
        op: ComparisonOp,
        right: Result<Operand>,
    ) -> Result<Operand> {
        match (left?, right?) {
            (Operand::Literal, Operand::Literal) => Err(Error::security(format!(
                "comparing two literals with '{op}' is a tautology"
            ))),
            (Operand::Condition, _) | (_, Operand::Condition) => Err(Error::security(format!(
                "conditions cannot be compared with '{op}'"
            ))),
            _ => Ok(Operand::Condition),
        }
    }

    fn and(&self, left: Result<Operand>, right: Result<Operand>) -> Result<Operand> {
        condition("AND", left?, right?)
    }

    fn or(&self, left: Result<Operand>, right: Result<Operand>) -> Result<Operand> {
        condition("OR", left?, right?)
    }

    fn nested(&self, expr: Result<Operand>) -> Result<Operand> {
        expr
    }

    fn function(&self, function: &'a Function, _args: Vec<Result<Operand>>) -> Result<Operand> {
        Err(Error::security(format!(
            "function {} is not allowed in predicates",
            function.name()
        )))
    }

    fn other(&self, expr: &'a ast::Expr) -> Result<Operand> {
        Err(Error::security(format!("'{expr}' is not allowed in predicates")))
    }
}

fn condition(connective: &str, left: Operand, right: Operand) -> Result<Operand> {
    if left == Operand::Condition && right == Operand::Condition {
        Ok(Operand::Condition)
    } else {
        Err(Error::security(format!(
            "the operands of {connective} must be comparisons"
        )))
    }
}

/// Accept a filter only if it is a well formed condition
pub fn validate_predicate(filter: &Expr) -> Result<()> {
    match filter.accept(&PredicateValidator)? {
        Operand::Condition => Ok(()),
        _ => Err(Error::security(format!("'{filter}' is not a condition"))),
    }
}
