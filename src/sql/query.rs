//! The closed query AST the pipeline works on.
//!
//! A [`Query`] is lowered from a `sqlparser` statement once and every later
//! transform is AST-in, AST-out. Nodes the middleware does not understand are
//! kept verbatim in [`Expr::Other`] so each component decides explicitly what
//! to do with them.

use super::{reader, visitor::DisplayVisitor, Error, Result};
use itertools::Itertools;
use sqlparser::ast;
use std::{fmt, result};

/// A literal value as written in the query
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Literal {
    /// The textual form of the number, as parsed
    Number(String),
    Text(String),
    Boolean(bool),
    Null,
}

impl Literal {
    pub fn integer(value: i64) -> Literal {
        Literal::Number(value.to_string())
    }

    /// The integer value of a number literal, `None` for anything else (`63.5`, `'63'`)
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Literal::Number(number) => number.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(number) => write!(f, "{number}"),
            Literal::Text(text) => write!(f, "'{}'", text.replace('\'', "''")),
            Literal::Boolean(true) => write!(f, "TRUE"),
            Literal::Boolean(false) => write!(f, "FALSE"),
            Literal::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOp {
    fn try_from_operator(op: &ast::BinaryOperator) -> Option<ComparisonOp> {
        match op {
            ast::BinaryOperator::Eq => Some(ComparisonOp::Eq),
            ast::BinaryOperator::NotEq => Some(ComparisonOp::NotEq),
            ast::BinaryOperator::Lt => Some(ComparisonOp::Lt),
            ast::BinaryOperator::LtEq => Some(ComparisonOp::LtEq),
            ast::BinaryOperator::Gt => Some(ComparisonOp::Gt),
            ast::BinaryOperator::GtEq => Some(ComparisonOp::GtEq),
            _ => None,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        })
    }
}

/// The aggregates the middleware can release
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<AggregateFunction> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunction::Count),
            "SUM" => Some(AggregateFunction::Sum),
            "AVG" => Some(AggregateFunction::Avg),
            "MIN" => Some(AggregateFunction::Min),
            "MAX" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A plain function call (no window, no filter)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Function {
    name: String,
    distinct: bool,
    args: Vec<Expr>,
}

impl Function {
    pub fn new(name: impl Into<String>, distinct: bool, args: Vec<Expr>) -> Self {
        let name: String = name.into();
        Function {
            name: name.to_ascii_uppercase(),
            distinct,
            args,
        }
    }

    pub fn aggregate(function: AggregateFunction, distinct: bool, arg: Expr) -> Self {
        Function::new(function.name(), distinct, vec![arg])
    }

    pub fn count_star() -> Self {
        Function::aggregate(AggregateFunction::Count, false, Expr::Wildcard)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn distinct(&self) -> bool {
        self.distinct
    }

    pub fn args(&self) -> &[Expr] {
        &self.args
    }

    /// Which aggregate this call is, if any
    pub fn aggregate_function(&self) -> Option<AggregateFunction> {
        AggregateFunction::from_name(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Column(String),
    Literal(Literal),
    /// `*`, only meaningful as a projection or a COUNT argument
    Wildcard,
    Comparison {
        left: Box<Expr>,
        op: ComparisonOp,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Nested(Box<Expr>),
    Function(Function),
    /// Anything else, kept as parsed
    Other(Box<ast::Expr>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn integer(value: i64) -> Expr {
        Expr::Literal(Literal::integer(value))
    }

    pub fn comparison(left: Expr, op: ComparisonOp, right: Expr) -> Expr {
        Expr::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Or(Box::new(left), Box::new(right))
    }

    pub fn nested(expr: Expr) -> Expr {
        Expr::Nested(Box::new(expr))
    }

    pub fn function(function: Function) -> Expr {
        Expr::Function(function)
    }

    /// The aggregate at the top of this expression, if any
    pub fn as_aggregate(&self) -> Option<(AggregateFunction, &Function)> {
        match self {
            Expr::Function(function) => function.aggregate_function().map(|a| (a, function)),
            _ => None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.as_aggregate().is_some()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.accept(&DisplayVisitor))
    }
}

/// An output expression, possibly aliased
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SelectItem {
    expr: Expr,
    alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self {
        SelectItem { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem {
            expr,
            alias: Some(alias.into()),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {}", self.expr, quote_identifier(alias)),
            None => write!(f, "{}", self.expr),
        }
    }
}

/// A single-table SELECT with an optional filter and grouping
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    projection: Vec<SelectItem>,
    table: String,
    filter: Option<Expr>,
    group_by: Vec<String>,
}

impl Query {
    pub fn new(
        projection: Vec<SelectItem>,
        table: impl Into<String>,
        filter: Option<Expr>,
        group_by: Vec<String>,
    ) -> Self {
        Query {
            projection,
            table: table.into(),
            filter,
            group_by,
        }
    }

    /// Parse and lower a single statement
    pub fn parse(sql: &str) -> Result<Query> {
        match reader::parse(sql)?.as_slice() {
            [statement] => Query::try_from(statement),
            statements => Err(Error::unsupported(format!(
                "a request with {} statements",
                statements.len()
            ))),
        }
    }

    pub fn projection(&self) -> &[SelectItem] {
        &self.projection
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    /// The same query with another output list
    pub fn with_projection(self, projection: Vec<SelectItem>) -> Query {
        Query { projection, ..self }
    }

    /// The same query with another filter
    pub fn with_filter(self, filter: Option<Expr>) -> Query {
        Query { filter, ..self }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT {} FROM {}",
            self.projection.iter().join(", "),
            quote_identifier(&self.table)
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        if !self.group_by.is_empty() {
            write!(
                f,
                " GROUP BY {}",
                self.group_by.iter().map(|c| quote_identifier(c)).join(", ")
            )?;
        }
        Ok(())
    }
}

/// Plain identifiers are printed as is, anything else is double-quoted
pub fn quote_identifier(name: &str) -> String {
    let mut chars = name.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

// Lowering from sqlparser

impl TryFrom<&ast::Statement> for Query {
    type Error = Error;

    fn try_from(statement: &ast::Statement) -> result::Result<Self, Self::Error> {
        match statement {
            ast::Statement::Query(query) => Query::try_from(query.as_ref()),
            _ => Err(Error::unsupported("a statement other than SELECT")),
        }
    }
}

impl TryFrom<&ast::Query> for Query {
    type Error = Error;

    fn try_from(query: &ast::Query) -> result::Result<Self, Self::Error> {
        if query.with.is_some() {
            return Err(Error::unsupported("WITH"));
        }
        if !query.order_by.is_empty()
            || query.limit.is_some()
            || query.offset.is_some()
            || query.fetch.is_some()
        {
            return Err(Error::unsupported("ORDER BY, LIMIT, OFFSET or FETCH"));
        }
        match query.body.as_ref() {
            ast::SetExpr::Select(select) => Query::try_from(select.as_ref()),
            ast::SetExpr::Query(query) => Query::try_from(query.as_ref()),
            ast::SetExpr::SetOperation { .. } => Err(Error::unsupported("UNION, EXCEPT or INTERSECT")),
            body => Err(Error::unsupported(format!("the query body {body}"))),
        }
    }
}

impl TryFrom<&ast::Select> for Query {
    type Error = Error;

    fn try_from(select: &ast::Select) -> result::Result<Self, Self::Error> {
        let ast::Select {
            distinct,
            top,
            projection,
            into,
            from,
            selection,
            group_by,
            having,
            ..
        } = select;
        if distinct.is_some() {
            return Err(Error::unsupported("SELECT DISTINCT"));
        }
        if top.is_some() || into.is_some() {
            return Err(Error::unsupported("TOP or INTO"));
        }
        if having.is_some() {
            return Err(Error::unsupported("HAVING"));
        }
        let (table, alias) = match from.as_slice() {
            [] => return Err(Error::unsupported("a query without FROM")),
            [table_with_joins] => table_reference(table_with_joins)?,
            _ => return Err(Error::unsupported("JOIN")),
        };
        let lowering = Lowering {
            table: &table,
            alias: alias.as_deref(),
        };
        let projection = projection
            .iter()
            .map(|item| lowering.select_item(item))
            .collect::<Result<Vec<_>>>()?;
        let filter = selection.as_ref().map(|e| lowering.expr(e)).transpose()?;
        let group_by = match group_by {
            ast::GroupByExpr::All => return Err(Error::unsupported("GROUP BY ALL")),
            ast::GroupByExpr::Expressions(exprs) => exprs
                .iter()
                .map(|e| match lowering.expr(e)? {
                    Expr::Column(column) => Ok(column),
                    other => Err(Error::unsupported(format!("grouping by {other}"))),
                })
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Query::new(projection, table, filter, group_by))
    }
}

/// The table name and optional alias of a join-free FROM item
fn table_reference(table_with_joins: &ast::TableWithJoins) -> Result<(String, Option<String>)> {
    if !table_with_joins.joins.is_empty() {
        return Err(Error::unsupported("JOIN"));
    }
    match &table_with_joins.relation {
        ast::TableFactor::Table { name, alias, .. } => match name.0.as_slice() {
            [table] => Ok((
                table.value.to_lowercase(),
                alias.as_ref().map(|alias| alias.name.value.to_lowercase()),
            )),
            _ => Err(Error::unsupported(format!("the qualified table name {name}"))),
        },
        ast::TableFactor::Derived { .. } => Err(Error::unsupported("subqueries")),
        ast::TableFactor::NestedJoin { .. } => Err(Error::unsupported("JOIN")),
        relation => Err(Error::unsupported(format!("the table expression {relation}"))),
    }
}

/// Lowers expressions in the context of the single queried table
struct Lowering<'a> {
    table: &'a str,
    alias: Option<&'a str>,
}

impl<'a> Lowering<'a> {
    fn qualifies(&self, qualifier: &str) -> bool {
        let qualifier = qualifier.to_lowercase();
        qualifier == self.table || Some(qualifier.as_str()) == self.alias
    }

    fn select_item(&self, item: &ast::SelectItem) -> Result<SelectItem> {
        Ok(match item {
            ast::SelectItem::UnnamedExpr(expr) => SelectItem::new(self.expr(expr)?),
            ast::SelectItem::ExprWithAlias { expr, alias } => {
                SelectItem::aliased(self.expr(expr)?, alias.value.clone())
            }
            ast::SelectItem::Wildcard(_) => SelectItem::new(Expr::Wildcard),
            ast::SelectItem::QualifiedWildcard { .. } => SelectItem::new(Expr::Wildcard),
        })
    }

    fn expr(&self, expr: &ast::Expr) -> Result<Expr> {
        match expr {
            ast::Expr::Identifier(ident) => Ok(Expr::Column(ident.value.to_lowercase())),
            ast::Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [qualifier, column] if self.qualifies(&qualifier.value) => {
                    Ok(Expr::Column(column.value.to_lowercase()))
                }
                _ => Err(Error::unsupported(format!("the column reference {expr}"))),
            },
            ast::Expr::Value(value) => Ok(literal(value)
                .map(Expr::Literal)
                .unwrap_or_else(|| Expr::Other(Box::new(expr.clone())))),
            ast::Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr: operand,
            } => match operand.as_ref() {
                ast::Expr::Value(ast::Value::Number(number, _)) => {
                    Ok(Expr::Literal(Literal::Number(format!("-{number}"))))
                }
                _ => Ok(Expr::Other(Box::new(expr.clone()))),
            },
            ast::Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => Ok(Expr::and(self.expr(left)?, self.expr(right)?)),
                ast::BinaryOperator::Or => Ok(Expr::or(self.expr(left)?, self.expr(right)?)),
                op => match ComparisonOp::try_from_operator(op) {
                    Some(op) => Ok(Expr::comparison(self.expr(left)?, op, self.expr(right)?)),
                    None => Ok(Expr::Other(Box::new(expr.clone()))),
                },
            },
            ast::Expr::Nested(inner) => Ok(Expr::nested(self.expr(inner)?)),
            ast::Expr::Function(function) => self.function(function, expr),
            _ => Ok(Expr::Other(Box::new(expr.clone()))),
        }
    }

    fn function(&self, function: &ast::Function, expr: &ast::Expr) -> Result<Expr> {
        let ast::Function {
            name,
            args,
            filter,
            over,
            within_group,
            ..
        } = function;
        if filter.is_some() || over.is_some() || !within_group.is_empty() {
            return Ok(Expr::Other(Box::new(expr.clone())));
        }
        let (distinct, args) = match args {
            ast::FunctionArguments::None => (false, vec![]),
            ast::FunctionArguments::Subquery(_) => return Ok(Expr::Other(Box::new(expr.clone()))),
            ast::FunctionArguments::List(list) => {
                if !list.clauses.is_empty() {
                    return Ok(Expr::Other(Box::new(expr.clone())));
                }
                let distinct = matches!(
                    list.duplicate_treatment,
                    Some(ast::DuplicateTreatment::Distinct)
                );
                let args = list
                    .args
                    .iter()
                    .map(|arg| self.function_arg(arg))
                    .collect::<Result<Vec<_>>>()?;
                (distinct, args)
            }
        };
        Ok(Expr::Function(Function::new(name.to_string(), distinct, args)))
    }

    fn function_arg(&self, arg: &ast::FunctionArg) -> Result<Expr> {
        match arg {
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(expr)) => self.expr(expr),
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => Ok(Expr::Wildcard),
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::QualifiedWildcard(name)) => {
                Err(Error::unsupported(format!("the argument {name}.*")))
            }
            ast::FunctionArg::Named { .. } => Err(Error::unsupported("named arguments")),
        }
    }
}

fn literal(value: &ast::Value) -> Option<Literal> {
    match value {
        ast::Value::Number(number, _) => Some(Literal::Number(number.clone())),
        ast::Value::SingleQuotedString(text) => Some(Literal::Text(text.clone())),
        ast::Value::Boolean(b) => Some(Literal::Boolean(*b)),
        ast::Value::Null => Some(Literal::Null),
        _ => None,
    }
}
