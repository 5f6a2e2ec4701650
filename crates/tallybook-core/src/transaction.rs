use std::{
    sync::{Condvar, Mutex, MutexGuard},
    thread::{self, ThreadId},
};

use crate::storage::{StorageError, TransactionId};

struct Owner {
    thread: ThreadId,
    tx_id: TransactionId,
}

/// Serializes writers against an open transaction.
///
/// Engines keep one transaction open at a time. While a thread owns it,
/// writes from every other thread wait until the owner commits or rolls
/// back, so a rollback only ever discards the owner's own writes. Lock
/// order is gate first, then engine state.
#[derive(Default)]
pub struct TransactionGate {
    owner: Mutex<Option<Owner>>,
    released: Condvar,
}

/// Exclusive turn on the gate. Held for the whole of one engine write.
pub struct Turn<'a> {
    gate: &'a TransactionGate,
    owner: MutexGuard<'a, Option<Owner>>,
}

impl Turn<'_> {
    /// Gives up ownership of the transaction and wakes waiting writers.
    pub fn finish(self) {
        let Turn { gate, mut owner } = self;
        *owner = None;
        drop(owner);
        gate.released.notify_all();
    }
}

impl TransactionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other thread owns a transaction.
    pub fn write_turn(&self) -> Result<Turn<'_>, StorageError> {
        let me = thread::current().id();
        let owner = self
            .released
            .wait_while(self.owner.lock()?, |o| matches!(o, Some(o) if o.thread != me))?;
        Ok(Turn { gate: self, owner })
    }

    /// Claims the transaction for the calling thread. The returned turn is
    /// held while the engine opens its snapshot or savepoint.
    pub fn begin(&self, tx_id: TransactionId) -> Result<Turn<'_>, StorageError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock()?;
        if matches!(&*owner, Some(o) if o.thread == me) {
            return Err(StorageError::Unsupported("nested transactions".to_string()));
        }
        owner = self.released.wait_while(owner, |o| o.is_some())?;
        *owner = Some(Owner { thread: me, tx_id });
        Ok(Turn { gate: self, owner })
    }

    /// Looks up the open transaction `tx_id` for commit or rollback. Call
    /// `finish` on the turn once the engine has applied the outcome.
    pub fn end(&self, tx_id: TransactionId) -> Result<Turn<'_>, StorageError> {
        let owner = self.owner.lock()?;
        if !matches!(&*owner, Some(o) if o.tx_id == tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        Ok(Turn { gate: self, owner })
    }

    /// The open transaction, if any.
    pub fn active(&self) -> Result<Option<TransactionId>, StorageError> {
        Ok(self.owner.lock()?.as_ref().map(|o| o.tx_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    #[test]
    fn test_nested_begin_on_same_thread() {
        let gate = TransactionGate::new();
        gate.begin(1).unwrap();
        assert!(matches!(gate.begin(2), Err(StorageError::Unsupported(_))));
        assert_eq!(gate.active().unwrap(), Some(1));
    }

    #[test]
    fn test_end_checks_transaction_id() {
        let gate = TransactionGate::new();
        drop(gate.begin(7).unwrap());
        assert!(matches!(gate.end(8), Err(StorageError::NoActiveTransaction)));
        gate.end(7).unwrap().finish();
        assert_eq!(gate.active().unwrap(), None);
        assert!(matches!(gate.end(7), Err(StorageError::NoActiveTransaction)));
    }

    #[test]
    fn test_owner_writes_pass_while_others_wait() {
        let gate = Arc::new(TransactionGate::new());
        drop(gate.begin(1).unwrap());
        drop(gate.write_turn().unwrap());

        let (tx, rx) = mpsc::channel();
        let writer = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                let turn = gate.write_turn().unwrap();
                tx.send(()).unwrap();
                drop(turn);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        gate.end(1).unwrap().finish();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }
}
