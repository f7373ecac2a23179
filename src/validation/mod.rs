//! # Query validation
//!
//! The [`Validator`] is the first gate of the pipeline: it parses the query
//! text, refuses anything that is not a single read-only SELECT over one table
//! the role may read, and returns the lowered query unchanged.
//!

pub mod predicate;

use crate::{
    policy::RolePolicy,
    schema::Schema,
    sql::{self, Query, Reader},
};
use sqlparser::ast;
use std::{collections::BTreeSet, error, fmt, ops::ControlFlow, result};

pub use predicate::validate_predicate;

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Syntax(String),
    Security(String),
}

impl Error {
    pub fn syntax(desc: impl fmt::Display) -> Error {
        Error::Syntax(format!("Invalid SQL syntax: {}", desc))
    }
    pub fn security(desc: impl fmt::Display) -> Error {
        Error::Security(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax(desc) => writeln!(f, "SyntaxError: {}", desc),
            Error::Security(desc) => writeln!(f, "SecurityError: {}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<sql::Error> for Error {
    fn from(err: sql::Error) -> Self {
        match err {
            sql::Error::ParsingError(desc) => Error::Syntax(desc),
            sql::Error::Unsupported(desc) | sql::Error::Other(desc) => Error::Security(desc),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// A query that passed validation, untouched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedQuery(Query);

impl ValidatedQuery {
    pub fn query(&self) -> &Query {
        &self.0
    }

    pub fn into_query(self) -> Query {
        self.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct Validator {
    reader: Reader,
    schema: Schema,
}

impl Validator {
    pub fn new(schema: Schema) -> Self {
        Validator {
            reader: Reader::new(),
            schema,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Validate a query text against a role policy
    pub fn validate(&self, sql: &str, policy: &RolePolicy) -> Result<ValidatedQuery> {
        let statements = self.reader.parse(sql).map_err(|err| match err {
            sql::Error::ParsingError(desc) => Error::syntax(desc),
            err => Error::from(err),
        })?;
        let statement = match statements.as_slice() {
            [statement] => statement,
            [] => return Err(Error::syntax("the query is empty")),
            _ => return Err(Error::security("Multiple statements are not allowed.")),
        };
        reject_modifications(statement)?;
        let query = match statement {
            ast::Statement::Query(query) => query,
            _ => return Err(Error::security("Only SELECT queries are allowed.")),
        };
        reject_joins_and_derived_tables(&query.body)?;
        reject_subqueries(statement)?;
        self.check_tables(statement, policy)?;
        let lowered = Query::try_from(statement)?;
        self.check_attributes(statement, &lowered, policy)?;
        if let Some(filter) = lowered.filter() {
            if !policy.predicates_allowed() {
                return Err(Error::security(format!(
                    "The {} role may not filter rows.",
                    policy.role()
                )));
            }
            validate_predicate(filter)?;
        }
        log::debug!("Query validated for the {} role", policy.role());
        Ok(ValidatedQuery(lowered))
    }

    /// Every table in the tree must exist and be readable by the role
    fn check_tables(&self, statement: &ast::Statement, policy: &RolePolicy) -> Result<()> {
        let mut tables = vec![];
        let _ = ast::visit_relations(statement, |relation| {
            tables.push(relation.clone());
            ControlFlow::<()>::Continue(())
        });
        for name in tables {
            let table = match name.0.as_slice() {
                [table] => table.value.to_lowercase(),
                _ => {
                    return Err(Error::security(format!(
                        "Table '{name}' does not exist in the allowed schema."
                    )))
                }
            };
            if self.schema.table(&table).is_none() {
                return Err(Error::security(format!(
                    "Table '{table}' does not exist in the allowed schema."
                )));
            }
            if !policy.allows_table(&table) {
                return Err(Error::security(format!(
                    "Access to table '{table}' is denied for the {} role.",
                    policy.role()
                )));
            }
        }
        Ok(())
    }

    /// Every attribute read must belong to the table and not be blocked for the role
    fn check_attributes(
        &self,
        statement: &ast::Statement,
        query: &Query,
        policy: &RolePolicy,
    ) -> Result<()> {
        let table = self.schema.table(query.table()).ok_or_else(|| {
            Error::security(format!(
                "Table '{}' does not exist in the allowed schema.",
                query.table()
            ))
        })?;
        let mut attributes = BTreeSet::new();
        let _ = ast::visit_expressions(statement, |expr| {
            match expr {
                ast::Expr::Identifier(ident) => {
                    attributes.insert(ident.value.to_lowercase());
                }
                ast::Expr::CompoundIdentifier(idents) => {
                    if let Some(ident) = idents.last() {
                        attributes.insert(ident.value.to_lowercase());
                    }
                }
                _ => {}
            }
            ControlFlow::<()>::Continue(())
        });
        attributes.extend(query.filter().map(|f| f.columns()).unwrap_or_default());
        for attribute in attributes {
            if policy.blocks(&attribute) {
                return Err(Error::security(format!(
                    "Access to attribute '{attribute}' is denied for the {} role.",
                    policy.role()
                )));
            }
            if !table.has_column(&attribute) {
                return Err(Error::security(format!(
                    "Unknown attribute '{attribute}' in table '{}'.",
                    table.name()
                )));
            }
        }
        Ok(())
    }
}

/// Data and schema modifications, wherever they appear in the tree
fn reject_modifications(statement: &ast::Statement) -> Result<()> {
    let flow = ast::visit_statements(statement, |statement| match statement {
        ast::Statement::Insert { .. }
        | ast::Statement::Update { .. }
        | ast::Statement::Delete { .. }
        | ast::Statement::Merge { .. }
        | ast::Statement::Truncate { .. }
        | ast::Statement::Copy { .. }
        | ast::Statement::Drop { .. }
        | ast::Statement::DropFunction { .. }
        | ast::Statement::AlterTable { .. }
        | ast::Statement::AlterIndex { .. }
        | ast::Statement::AlterView { .. }
        | ast::Statement::CreateTable { .. }
        | ast::Statement::CreateView { .. }
        | ast::Statement::CreateIndex { .. }
        | ast::Statement::CreateSchema { .. }
        | ast::Statement::CreateDatabase { .. }
        | ast::Statement::CreateFunction { .. } => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    });
    match flow {
        ControlFlow::Break(()) => Err(Error::security("Modification queries are not allowed.")),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn reject_joins_and_derived_tables(body: &ast::SetExpr) -> Result<()> {
    match body {
        ast::SetExpr::Select(select) => {
            if select.from.len() > 1 {
                return Err(Error::security("JOINs are not allowed."));
            }
            for table_with_joins in &select.from {
                if !table_with_joins.joins.is_empty() {
                    return Err(Error::security("JOINs are not allowed."));
                }
                match &table_with_joins.relation {
                    ast::TableFactor::NestedJoin { .. } => {
                        return Err(Error::security("JOINs are not allowed."))
                    }
                    ast::TableFactor::Derived { .. } => {
                        return Err(Error::security("Subqueries are not allowed."))
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        ast::SetExpr::Query(query) => reject_joins_and_derived_tables(&query.body),
        ast::SetExpr::SetOperation { left, right, .. } => {
            reject_joins_and_derived_tables(left)?;
            reject_joins_and_derived_tables(right)
        }
        _ => Ok(()),
    }
}

/// Scalar, IN and EXISTS subqueries
fn reject_subqueries(statement: &ast::Statement) -> Result<()> {
    let flow = ast::visit_expressions(statement, |expr| match expr {
        ast::Expr::Subquery(_) | ast::Expr::InSubquery { .. } | ast::Expr::Exists { .. } => {
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    });
    match flow {
        ControlFlow::Break(()) => Err(Error::security("Subqueries are not allowed.")),
        ControlFlow::Continue(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;

    fn validate(sql: &str, role: Role) -> Result<ValidatedQuery> {
        Validator::default().validate(sql, &role.policy())
    }

    #[test]
    fn test_accepted() -> Result<()> {
        for (sql, role) in [
            ("SELECT COUNT(*) FROM patients WHERE age = 63", Role::Doctor),
            ("SELECT AVG(age) FROM patients WHERE gender = 'F'", Role::Researcher),
            ("SELECT COUNT(*), gender FROM patients GROUP BY gender", Role::Doctor),
            ("SELECT SUM(privacy_budget) FROM staffs", Role::Accounting),
            ("SELECT COUNT(DISTINCT patient_id) FROM diagnoses WHERE disease_name = 'Flu'", Role::Manager),
            ("SELECT * FROM patients", Role::Doctor),
            ("SELECT COUNT(p.age) FROM patients AS p WHERE p.age > 3", Role::Doctor),
        ] {
            let validated = validate(sql, role)?;
            println!("{sql} => {}", validated.query());
        }
        // The validated query is the lowered input, not a rewrite of it
        assert_eq!(
            validate("SELECT COUNT(*) FROM patients WHERE age = 63", Role::Doctor)?.into_query(),
            Query::parse("SELECT COUNT(*) FROM patients WHERE age = 63")?
        );
        Ok(())
    }

    #[test]
    fn test_syntax_errors() {
        for sql in ["SELEC COUNT(*) FROM patients", "", "SELECT COUNT(* FROM patients"] {
            let result = validate(sql, Role::Doctor);
            println!("{sql:?} => {result:?}");
            assert!(matches!(result, Err(Error::Syntax(_))));
        }
    }

    #[test]
    fn test_security_errors() {
        for (sql, role) in [
            ("SELECT COUNT(*) FROM patients; DROP TABLE patients", Role::Doctor),
            ("DELETE FROM patients", Role::Manager),
            ("UPDATE staffs SET privacy_budget = 1000", Role::Manager),
            ("INSERT INTO patients (patient_id) VALUES (1)", Role::Manager),
            ("DROP TABLE patients", Role::Manager),
            ("CREATE TABLE t (x INT)", Role::Manager),
            ("ALTER TABLE patients ADD COLUMN x INT", Role::Manager),
            ("TRUNCATE TABLE patients", Role::Manager),
            ("SHOW TABLES", Role::Manager),
            ("SELECT COUNT(*) FROM patients JOIN diagnoses ON patients.patient_id = diagnoses.patient_id", Role::Doctor),
            ("SELECT COUNT(*) FROM patients, diagnoses", Role::Doctor),
            ("SELECT COUNT(*) FROM (SELECT * FROM patients) AS t", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE age > (SELECT AVG(age) FROM patients)", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE patient_id IN (SELECT patient_id FROM diagnoses)", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE EXISTS (SELECT 1 FROM diagnoses)", Role::Doctor),
            ("SELECT COUNT(*) FROM doctors", Role::Doctor),
            ("SELECT COUNT(*) FROM sqlite_master", Role::Manager),
            ("SELECT COUNT(*) FROM staffs", Role::Doctor),
            ("SELECT COUNT(*) FROM patients", Role::Accounting),
            ("SELECT COUNT(*) FROM patients", Role::Employee),
            ("SELECT COUNT(*) FROM patients", Role::Restricted),
            ("SELECT COUNT(national_id) FROM patients", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE full_name = 'x'", Role::Manager),
            ("SELECT COUNT(*) FROM patients GROUP BY address", Role::Doctor),
            ("SELECT COUNT(dob) FROM patients", Role::Researcher),
            ("SELECT COUNT(*) FROM patients WHERE salary > 3", Role::Doctor),
            ("SELECT COUNT(*) FROM staffs WHERE age > 30", Role::Accounting),
            ("SELECT COUNT(*) FROM patients WHERE 1 = 1", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE age = 3 OR 'a' = 'a'", Role::Doctor),
            ("SELECT COUNT(*) FROM patients WHERE LENGTH(gender) = 1", Role::Doctor),
            ("SELECT COUNT(*) FROM patients UNION SELECT COUNT(*) FROM diagnoses", Role::Doctor),
            ("SELECT COUNT(*) FROM patients ORDER BY 1", Role::Doctor),
        ] {
            let result = validate(sql, role);
            println!("{sql} ({role}) => {result:?}");
            assert!(matches!(result, Err(Error::Security(_))));
        }
    }
}
