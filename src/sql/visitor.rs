//! A bottom-up visitor over the closed query AST.
//!
//! Each variant of [`Expr`] has its own method, and sub-expressions are
//! visited first so the methods receive the results for their children.

use super::query::{quote_identifier, ComparisonOp, Expr, Function, Literal};
use itertools::Itertools;
use sqlparser::ast;
use std::ops::ControlFlow;

/// A Visitor for the type Expr
pub trait Visitor<'a, T> {
    fn column(&self, name: &'a str) -> T;
    fn literal(&self, literal: &'a Literal) -> T;
    fn wildcard(&self) -> T;
    fn comparison(&self, left: T, op: ComparisonOp, right: T) -> T;
    fn and(&self, left: T, right: T) -> T;
    fn or(&self, left: T, right: T) -> T;
    fn nested(&self, expr: T) -> T;
    fn function(&self, function: &'a Function, args: Vec<T>) -> T;
    /// Nodes outside the closed AST
    fn other(&self, expr: &'a ast::Expr) -> T;
}

impl Expr {
    pub fn accept<'a, T, V: Visitor<'a, T>>(&'a self, visitor: &V) -> T {
        match self {
            Expr::Column(name) => visitor.column(name),
            Expr::Literal(literal) => visitor.literal(literal),
            Expr::Wildcard => visitor.wildcard(),
            Expr::Comparison { left, op, right } => {
                let left = left.accept(visitor);
                let right = right.accept(visitor);
                visitor.comparison(left, *op, right)
            }
            Expr::And(left, right) => {
                let left = left.accept(visitor);
                let right = right.accept(visitor);
                visitor.and(left, right)
            }
            Expr::Or(left, right) => {
                let left = left.accept(visitor);
                let right = right.accept(visitor);
                visitor.or(left, right)
            }
            Expr::Nested(expr) => {
                let expr = expr.accept(visitor);
                visitor.nested(expr)
            }
            Expr::Function(function) => {
                let args = function
                    .args()
                    .iter()
                    .map(|arg| arg.accept(visitor))
                    .collect();
                visitor.function(function, args)
            }
            Expr::Other(expr) => visitor.other(expr),
        }
    }

    /// Every column the expression reads, in order of appearance
    pub fn columns(&self) -> Vec<String> {
        self.accept(&ColumnsVisitor)
    }
}

/// Renders the canonical SQL text of an expression
pub struct DisplayVisitor;

impl<'a> Visitor<'a, String> for DisplayVisitor {
    fn column(&self, name: &'a str) -> String {
        quote_identifier(name)
    }

    fn literal(&self, literal: &'a Literal) -> String {
        literal.to_string()
    }

    fn wildcard(&self) -> String {
        "*".to_string()
    }

    fn comparison(&self, left: String, op: ComparisonOp, right: String) -> String {
        format!("{left} {op} {right}")
    }

    fn and(&self, left: String, right: String) -> String {
        format!("{left} AND {right}")
    }

    fn or(&self, left: String, right: String) -> String {
        format!("{left} OR {right}")
    }

    fn nested(&self, expr: String) -> String {
        format!("({expr})")
    }

    fn function(&self, function: &'a Function, args: Vec<String>) -> String {
        format!(
            "{}({}{})",
            function.name(),
            if function.distinct() { "DISTINCT " } else { "" },
            args.iter().join(", ")
        )
    }

    fn other(&self, expr: &'a ast::Expr) -> String {
        expr.to_string()
    }
}

/// Collects the (lowercased) column names an expression reads
pub struct ColumnsVisitor;

impl<'a> Visitor<'a, Vec<String>> for ColumnsVisitor {
    fn column(&self, name: &'a str) -> Vec<String> {
        vec![name.to_string()]
    }

    fn literal(&self, _literal: &'a Literal) -> Vec<String> {
        vec![]
    }

    fn wildcard(&self) -> Vec<String> {
        vec![]
    }

    fn comparison(&self, left: Vec<String>, _op: ComparisonOp, right: Vec<String>) -> Vec<String> {
        left.into_iter().chain(right).collect()
    }

    fn and(&self, left: Vec<String>, right: Vec<String>) -> Vec<String> {
        left.into_iter().chain(right).collect()
    }

    fn or(&self, left: Vec<String>, right: Vec<String>) -> Vec<String> {
        left.into_iter().chain(right).collect()
    }

    fn nested(&self, expr: Vec<String>) -> Vec<String> {
        expr
    }

    fn function(&self, _function: &'a Function, args: Vec<Vec<String>>) -> Vec<String> {
        args.into_iter().flatten().collect()
    }

    fn other(&self, expr: &'a ast::Expr) -> Vec<String> {
        let mut columns = vec![];
        let _ = ast::visit_expressions(expr, |expr| {
            match expr {
                ast::Expr::Identifier(ident) => columns.push(ident.value.to_lowercase()),
                ast::Expr::CompoundIdentifier(idents) => {
                    if let Some(ident) = idents.last() {
                        columns.push(ident.value.to_lowercase())
                    }
                }
                _ => {}
            }
            ControlFlow::<()>::Continue(())
        });
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Query, Result};

    #[test]
    fn test_display_visitor() -> Result<()> {
        let query = Query::parse(
            "SELECT COUNT(DISTINCT patient_id) FROM diagnoses WHERE (disease_name = 'Flu' OR staff_id >= 2) AND diagnosis_id <> 3",
        )?;
        let filter = query.filter().unwrap();
        let text = filter.accept(&DisplayVisitor);
        println!("{text}");
        assert_eq!(
            text,
            "(disease_name = 'Flu' OR staff_id >= 2) AND diagnosis_id <> 3"
        );
        assert_eq!(
            query.projection()[0].expr().accept(&DisplayVisitor),
            "COUNT(DISTINCT patient_id)"
        );
        Ok(())
    }

    #[test]
    fn test_columns() -> Result<()> {
        let query = Query::parse(
            "SELECT SUM(age) FROM patients WHERE gender = 'F' AND (age > 3 OR address LIKE 'School%' OR COALESCE(National_ID, full_name) IS NULL)",
        )?;
        let columns = query.filter().unwrap().columns();
        println!("{columns:?}");
        assert_eq!(
            columns,
            vec!["gender", "age", "address", "national_id", "full_name"]
        );
        assert_eq!(query.projection()[0].expr().columns(), vec!["age"]);
        Ok(())
    }
}
