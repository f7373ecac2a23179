use super::Result;
use sqlparser::{
    ast::Statement,
    dialect::{Dialect, GenericDialect},
    parser::Parser,
};
use std::sync::Arc;

/// Parses query text into `sqlparser` statements
#[derive(Debug, Clone)]
pub struct Reader {
    sql_dialect: Arc<dyn Dialect + Send + Sync>,
}

impl Reader {
    pub fn new() -> Self {
        Reader {
            sql_dialect: Arc::new(GenericDialect {}),
        }
    }

    /// All the statements found in the text, in order
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        Ok(Parser::parse_sql(self.sql_dialect.as_ref(), sql)?)
    }
}

impl Default for Reader {
    fn default() -> Self {
        Reader::new()
    }
}

/// Parse with the generic dialect
pub fn parse(sql: &str) -> Result<Vec<Statement>> {
    Reader::new().parse(sql)
}
