//! Reentrant transaction bookkeeping for the single store connection
//!
//! Only the outermost `transaction` call issues `BEGIN`/`COMMIT`/`ROLLBACK`;
//! nested calls run inside the already open transaction.

use crate::error::{CodevecError, Result};
use rusqlite::Connection;

/// Transaction depth of one connection
#[derive(Debug, Default)]
pub struct TransactionState {
    depth: u32,
}

impl TransactionState {
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Enter a transaction scope, opening a real transaction at depth zero
    pub(crate) fn enter(&mut self, conn: &Connection) -> Result<()> {
        if self.depth == 0 {
            // A transaction we did not open means someone else is driving this connection.
            if !conn.is_autocommit() {
                return Err(CodevecError::Transaction(
                    "connection already has a transaction that this store did not open".to_string(),
                ));
            }
            conn.execute_batch("BEGIN IMMEDIATE")?;
            log::trace!("Transaction opened");
        }
        self.depth += 1;
        Ok(())
    }

    /// Leave a transaction scope; the outermost scope commits or rolls back
    pub(crate) fn exit(&mut self, conn: &Connection, success: bool) -> Result<()> {
        if self.depth == 0 {
            return Err(CodevecError::Transaction(
                "transaction exit without matching enter".to_string(),
            ));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        if success {
            if let Err(e) = conn.execute_batch("COMMIT") {
                log::error!("Commit failed, rolling back: {}", e);
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback after failed commit also failed: {}", rollback_err);
                }
                return Err(CodevecError::Database(e));
            }
            log::trace!("Transaction committed");
        } else {
            conn.execute_batch("ROLLBACK")?;
            log::debug!("Transaction rolled back");
        }
        Ok(())
    }
}
