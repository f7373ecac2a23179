use crate::sql::{Expr, Function, Query, SelectItem};

/// Replace a projection without any aggregate with a single `COUNT(*)`
pub fn enforce_aggregation(query: Query) -> Query {
    if query.projection().iter().any(|item| item.expr().is_aggregate()) {
        query
    } else {
        log::debug!("No aggregate in the projection, releasing a count instead");
        query.with_projection(vec![SelectItem::new(Expr::function(Function::count_star()))])
    }
}
