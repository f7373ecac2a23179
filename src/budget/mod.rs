//! # Per-principal privacy budget
//!
//! Budgets live in the staff table and are only ever decremented by committed
//! queries (or set by an administrative reset). Costs of requests still in
//! flight are held in memory as [`Reservation`]s, so two concurrent requests
//! can never jointly overspend a budget.
//!
//! Lock order is always: pending reservations, then the store.
//!

pub mod committer;

use crate::{
    io::{self, Store, Value},
    schema::{BUDGET_COLUMN, PRINCIPAL_COLUMN, STAFF_TABLE},
};
use std::{
    collections::HashMap,
    error, fmt, result,
    sync::{Arc, Mutex, MutexGuard},
};

pub use committer::BudgetCommitter;

// Error management

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    BudgetExhausted { requested: f64, remaining: f64 },
    InvalidCost(f64),
    Store(String),
    Lock(String),
    Other(String),
}

impl Error {
    pub fn budget_exhausted(requested: f64, remaining: f64) -> Error {
        Error::BudgetExhausted {
            requested,
            remaining,
        }
    }
    pub fn store(desc: impl fmt::Display) -> Error {
        Error::Store(desc.to_string())
    }
    pub fn lock(desc: impl fmt::Display) -> Error {
        Error::Lock(format!("Poisoned ledger lock {}", desc))
    }
    pub fn other(desc: impl fmt::Display) -> Error {
        Error::Other(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BudgetExhausted {
                requested,
                remaining,
            } => writeln!(
                f,
                "BudgetExhausted: requested {requested}, remaining {remaining}"
            ),
            Error::InvalidCost(cost) => writeln!(f, "InvalidCost: {}", cost),
            Error::Store(desc) => writeln!(f, "Store: {}", desc),
            Error::Lock(desc) => writeln!(f, "Lock: {}", desc),
            Error::Other(desc) => writeln!(f, "{}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::store(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Absorbs rounding when a budget is spent in fractional steps (10 = 3 × 10/3)
const TOLERANCE: f64 = 1e-9;

fn validate_cost(cost: f64) -> Result<f64> {
    if cost.is_finite() && cost > 0. {
        Ok(cost)
    } else {
        Err(Error::InvalidCost(cost))
    }
}

/// The durable ledger and the costs held by requests in flight
#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn Store>,
    pending: Arc<Mutex<HashMap<String, f64>>>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        BudgetLedger {
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<String, f64>>> {
        self.pending.lock().map_err(|err| Error::lock(err))
    }

    /// The durable budget, 0 for an unknown principal
    pub fn get_budget(&self, principal: &str) -> Result<f64> {
        let rows = self.store.execute(
            &format!("SELECT {BUDGET_COLUMN} FROM {STAFF_TABLE} WHERE {PRINCIPAL_COLUMN} = ?1"),
            &[Value::text(principal)],
        )?;
        Ok(rows
            .first()
            .and_then(|row| row.value(0))
            .and_then(Value::as_f64)
            .unwrap_or(0.))
    }

    fn remaining_with(&self, pending: &HashMap<String, f64>, principal: &str) -> Result<f64> {
        Ok(self.get_budget(principal)? - pending.get(principal).copied().unwrap_or(0.))
    }

    /// The durable budget minus the costs currently reserved
    pub fn remaining(&self, principal: &str) -> Result<f64> {
        let pending = self.pending()?;
        self.remaining_with(&pending, principal)
    }

    /// Fail if the remaining budget does not cover the cost
    pub fn check(&self, principal: &str, cost: f64) -> Result<()> {
        let cost = validate_cost(cost)?;
        let remaining = self.remaining(principal)?;
        if remaining + TOLERANCE < cost {
            return Err(Error::budget_exhausted(cost, remaining.max(0.)));
        }
        Ok(())
    }

    /// Deduct the cost durably, without checking it first
    pub fn consume(&self, principal: &str, cost: f64) -> Result<()> {
        let cost = validate_cost(cost)?;
        let _pending = self.pending()?;
        self.deduct(principal, cost)
    }

    fn deduct(&self, principal: &str, cost: f64) -> Result<()> {
        self.store.execute(
            &format!(
                "UPDATE {STAFF_TABLE} SET {BUDGET_COLUMN} = {BUDGET_COLUMN} - ?1 WHERE {PRINCIPAL_COLUMN} = ?2"
            ),
            &[Value::Float(cost), Value::text(principal)],
        )?;
        log::info!("Deducted {cost} from the budget of a principal");
        Ok(())
    }

    /// Set the durable budget, the only way it can grow
    pub fn reset(&self, principal: &str, amount: f64) -> Result<()> {
        if !(amount.is_finite() && amount >= 0.) {
            return Err(Error::InvalidCost(amount));
        }
        let _pending = self.pending()?;
        self.store.execute(
            &format!(
                "UPDATE {STAFF_TABLE} SET {BUDGET_COLUMN} = ?1 WHERE {PRINCIPAL_COLUMN} = ?2"
            ),
            &[Value::Float(amount), Value::text(principal)],
        )?;
        log::info!("Budget of a principal reset to {amount}");
        Ok(())
    }

    /// Check the cost and hold it until the reservation is committed or dropped
    pub fn reserve(&self, principal: &str, cost: f64) -> Result<Reservation> {
        let cost = validate_cost(cost)?;
        let mut pending = self.pending()?;
        let remaining = self.remaining_with(&pending, principal)?;
        if remaining + TOLERANCE < cost {
            return Err(Error::budget_exhausted(cost, remaining.max(0.)));
        }
        *pending.entry(principal.to_string()).or_insert(0.) += cost;
        Ok(Reservation {
            ledger: self.clone(),
            principal: principal.to_string(),
            cost,
            settled: false,
        })
    }

    /// Deduct a held cost durably then release the hold
    fn settle(&self, principal: &str, cost: f64) -> Result<()> {
        let mut pending = self.pending()?;
        self.deduct(principal, cost)?;
        release(&mut pending, principal, cost);
        Ok(())
    }
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger").finish_non_exhaustive()
    }
}

fn release(pending: &mut HashMap<String, f64>, principal: &str, cost: f64) {
    if let Some(held) = pending.get_mut(principal) {
        *held -= cost;
        if *held <= TOLERANCE {
            pending.remove(principal);
        }
    }
}

/// A cost held against a principal's budget
#[derive(Debug)]
pub struct Reservation {
    ledger: BudgetLedger,
    principal: String,
    cost: f64,
    settled: bool,
}

impl Reservation {
    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Deduct the cost durably. On failure the hold is released and nothing is spent.
    pub fn commit(mut self) -> Result<()> {
        self.try_commit()
    }

    /// Deduct the cost durably, keeping it held if the store refuses
    fn try_commit(&mut self) -> Result<()> {
        if !self.settled {
            self.ledger.settle(&self.principal, self.cost)?;
            self.settled = true;
        }
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.ledger.pending.lock() {
            Ok(mut pending) => release(&mut pending, &self.principal, self.cost),
            Err(poisoned) => release(&mut poisoned.into_inner(), &self.principal, self.cost),
        }
        log::debug!("Released a reservation of {}", self.cost);
    }
}
