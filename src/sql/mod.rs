//! # SQL parsing and lowering into a closed query AST
//!
//! Queries are parsed by `sqlparser` and lowered once into [`Query`], a small
//! tagged-variant tree that the validator, the rewriter and the DP engine all
//! match over. The tree is turned back into text only when it is executed.
//!

pub mod query;
pub mod reader;
pub mod visitor;

use std::{
    convert::Infallible,
    error, fmt,
    num::{ParseFloatError, ParseIntError},
    result,
};

use sqlparser::parser::ParserError;
use sqlparser::tokenizer::TokenizerError;

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParsingError(String),
    Unsupported(String),
    Other(String),
}

impl Error {
    pub fn parsing_error(input: impl fmt::Display) -> Error {
        Error::ParsingError(format!("Cannot parse {}", input))
    }
    pub fn unsupported(construct: impl fmt::Display) -> Error {
        Error::Unsupported(format!("{} is not supported", construct))
    }
    pub fn other<T: fmt::Display>(desc: T) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParsingError(input) => writeln!(f, "ParsingError: {}", input),
            Error::Unsupported(desc) => writeln!(f, "Unsupported: {}", desc),
            Error::Other(err) => writeln!(f, "{}", err),
        }
    }
}

impl error::Error for Error {}

impl From<Infallible> for Error {
    fn from(err: Infallible) -> Self {
        Error::Other(err.to_string())
    }
}
impl From<TokenizerError> for Error {
    fn from(err: TokenizerError) -> Self {
        Error::parsing_error(err)
    }
}
impl From<ParserError> for Error {
    fn from(err: ParserError) -> Self {
        Error::parsing_error(err)
    }
}
impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Error::Other(err.to_string())
    }
}
impl From<ParseFloatError> for Error {
    fn from(err: ParseFloatError) -> Self {
        Error::Other(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;

// Import a few functions
pub use query::{
    AggregateFunction, ComparisonOp, Expr, Function, Literal, Query, SelectItem,
};
pub use reader::{parse, Reader};
pub use visitor::Visitor;
