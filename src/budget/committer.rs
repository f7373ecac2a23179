//! Deferred budget commits on a background worker.
//!
//! Reservations are committed in submission order by a single thread, so the
//! deductions of a principal land in the order their queries finished. The
//! cost stays held in the ledger until the worker commits it. A commit the
//! store refuses stays held and is retried at every flush, which reports it
//! until it lands.

use super::{Error, Reservation, Result};
use std::{
    sync::{
        mpsc::{self, Sender},
        Mutex,
    },
    thread::{self, JoinHandle},
};

enum Command {
    Commit(Reservation),
    Flush(Sender<Result<()>>),
}

/// Commit again the reservations that failed, keeping those that fail again
fn retry(failed: &mut Vec<Reservation>) -> Result<()> {
    let mut last_error = None;
    failed.retain_mut(|reservation| match reservation.try_commit() {
        Ok(()) => false,
        Err(err) => {
            last_error = Some(err);
            true
        }
    });
    match last_error {
        None => Ok(()),
        Some(err) => Err(Error::store(format!(
            "{} deferred commit(s) still held: {}",
            failed.len(),
            err.to_string().trim_end()
        ))),
    }
}

pub struct BudgetCommitter {
    sender: Mutex<Option<Sender<Command>>>,
    worker: Option<JoinHandle<()>>,
}

impl BudgetCommitter {
    /// Start the worker
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name("budget-committer".to_string())
            .spawn(move || {
                let mut failed = vec![];
                for command in receiver {
                    match command {
                        Command::Commit(mut reservation) => {
                            if let Err(err) = reservation.try_commit() {
                                log::warn!(
                                    "Deferred commit of {} failed, keeping it held: {}",
                                    reservation.cost(),
                                    err.to_string().trim_end()
                                );
                                failed.push(reservation);
                            }
                        }
                        Command::Flush(done) => {
                            let _ = done.send(retry(&mut failed));
                        }
                    }
                }
                if let Err(err) = retry(&mut failed) {
                    log::warn!("Budget committer stopped with uncommitted costs: {}", err.to_string().trim_end());
                }
                log::debug!("Budget committer stopped");
            })
            .map_err(Error::other)?;
        Ok(BudgetCommitter {
            sender: Mutex::new(Some(sender)),
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.lock().map_err(|err| Error::lock(err))?;
        sender
            .as_ref()
            .ok_or_else(|| Error::other("the budget committer is stopped"))?
            .send(command)
            .map_err(|_| Error::other("the budget committer is stopped"))
    }

    /// Queue a reservation for commit. If the worker is gone the reservation is released.
    pub fn submit(&self, reservation: Reservation) -> Result<()> {
        self.send(Command::Commit(reservation))
    }

    /// Block until every reservation submitted before is committed.
    /// Fails while a commit refused by the store is still held.
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.send(Command::Flush(done))?;
        wait.recv()
            .map_err(|_| Error::other("the budget committer stopped before flushing"))?
    }
}

impl Drop for BudgetCommitter {
    /// Drain the queue, then join the worker
    fn drop(&mut self) {
        match self.sender.get_mut() {
            Ok(sender) => drop(sender.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("The budget committer panicked");
            }
        }
    }
}
