//! Unit-of-work context and command execution.

pub mod command;
pub mod unit_of_work;

pub use command::{Command, CommandExecutor, CommitOutcome};
pub use unit_of_work::{Savepoint, TransactionListener, TransactionOutcome, UnitOfWork};
