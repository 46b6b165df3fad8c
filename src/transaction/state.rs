//! Transaction state machine.
//!
//! Transactions move through states: AVAILABLE → INITIALIZING → ACTIVE →
//! (LIMBO →) COMMITTED | ROLLED BACK → AVAILABLE
//!
//! Every transition is a compare-and-swap, so a transaction object can be
//! polled and recycled without holding the manager's lock.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, SerialDbError};

/// Possible states of a transaction object.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Free for reuse.
    Available = 0,
    /// Claimed from the free list, not yet handed out.
    Initializing = 1,
    /// Reading and writing.
    Active = 2,
    /// Prepared for two-phase commit, waiting for the coordinator.
    Limbo = 3,
    Committed = 4,
    RolledBack = 5,
}

impl TryFrom<u8> for TransactionState {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TransactionState::Available),
            1 => Ok(TransactionState::Initializing),
            2 => Ok(TransactionState::Active),
            3 => Ok(TransactionState::Limbo),
            4 => Ok(TransactionState::Committed),
            5 => Ok(TransactionState::RolledBack),
            _ => Err(()),
        }
    }
}

impl TransactionState {
    /// Returns true if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::{Active, Available, Committed, Initializing, Limbo, RolledBack};
        matches!(
            (self, next),
            (Available, Initializing)
                | (Initializing, Active | Available)
                | (Active, Limbo | Committed | RolledBack)
                | (Limbo, Committed | RolledBack)
                | (Committed | RolledBack, Available)
        )
    }

    /// Returns true once the transaction has an outcome.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// Atomic holder of a [`TransactionState`].
#[derive(Debug)]
pub struct AtomicTransactionState {
    state: AtomicU8,
}

impl AtomicTransactionState {
    /// Creates a holder in `state`.
    #[must_use]
    pub fn new(state: TransactionState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn get(&self) -> TransactionState {
        TransactionState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(TransactionState::Available)
    }

    /// Attempts `from → to`. Returns false if the state was not `from`.
    ///
    /// Illegal transitions always fail.
    pub fn try_transition(&self, from: TransactionState, to: TransactionState) -> bool {
        from.can_transition_to(to)
            && self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Performs `from → to`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the transition is illegal or the
    /// state was not `from`.
    pub fn transition(&self, from: TransactionState, to: TransactionState) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(SerialDbError::TransactionError(format!(
                "illegal transaction state transition {from:?} -> {to:?}"
            )));
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|actual| {
                SerialDbError::TransactionError(format!(
                    "expected transaction state {from:?}, found {:?}",
                    TransactionState::try_from(actual)
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_lifecycle() {
        let state = AtomicTransactionState::new(TransactionState::Available);
        state
            .transition(TransactionState::Available, TransactionState::Initializing)
            .unwrap();
        state
            .transition(TransactionState::Initializing, TransactionState::Active)
            .unwrap();
        state
            .transition(TransactionState::Active, TransactionState::Limbo)
            .unwrap();
        state
            .transition(TransactionState::Limbo, TransactionState::Committed)
            .unwrap();
        state
            .transition(TransactionState::Committed, TransactionState::Available)
            .unwrap();
        assert_eq!(state.get(), TransactionState::Available);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let state = AtomicTransactionState::new(TransactionState::Active);
        assert!(state
            .transition(TransactionState::Active, TransactionState::Available)
            .is_err());
        assert!(!state.try_transition(TransactionState::Active, TransactionState::Initializing));
        // Legal transition from the wrong current state.
        assert!(!state.try_transition(TransactionState::Limbo, TransactionState::Committed));
        assert!(state
            .transition(TransactionState::Available, TransactionState::Initializing)
            .is_err());
        assert_eq!(state.get(), TransactionState::Active);

        assert!(!TransactionState::Committed.can_transition_to(TransactionState::RolledBack));
        assert!(TransactionState::RolledBack.is_terminal());
    }
}
