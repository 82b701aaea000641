use std::{
    collections::HashMap,
    sync::Mutex,
};

use crate::{errors::BudgetError, types::MicroUsdc};

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub limit: MicroUsdc,
    pub spent: MicroUsdc,
    pub reserved: MicroUsdc,
    pub remaining: MicroUsdc,
    pub blocked: bool,
}

/// Handle returned by a successful reservation. Committing or releasing
/// consumes the handle; both are idempotent on the underlying id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationHandle(u64);

impl ReservationHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Outstanding,
    Committed,
    Released,
}

#[derive(Debug)]
struct Reservation {
    amount: MicroUsdc,
    state: ReservationState,
}

#[derive(Debug)]
struct Inner {
    spent: MicroUsdc,
    outstanding: MicroUsdc,
    reservations: HashMap<u64, Reservation>,
    next_id: u64,
}

/// Single source of truth for budget spend. All arithmetic is integer
/// micro-USDC; all mutation happens inside one critical section.
#[derive(Debug)]
pub struct BudgetLedger {
    limit: MicroUsdc,
    minimum_operational: MicroUsdc,
    inner: Mutex<Inner>,
}

impl BudgetLedger {
    pub fn new(limit: MicroUsdc, minimum_operational: MicroUsdc) -> Self {
        Self {
            limit,
            minimum_operational,
            inner: Mutex::new(Inner {
                spent: MicroUsdc::ZERO,
                outstanding: MicroUsdc::ZERO,
                reservations: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Pre-load spend, e.g. when replaying a recorded run.
    pub fn with_spent(limit: MicroUsdc, minimum_operational: MicroUsdc, spent: MicroUsdc) -> Self {
        let ledger = Self::new(limit, minimum_operational);
        ledger.inner.lock().expect("budget lock").spent = spent;
        ledger
    }

    pub fn limit(&self) -> MicroUsdc {
        self.limit
    }

    fn snapshot_locked(&self, inner: &Inner) -> BudgetSnapshot {
        let committed = inner
            .spent
            .checked_add(inner.outstanding)
            .unwrap_or(self.limit);
        let remaining = self.limit.saturating_sub(committed);
        BudgetSnapshot {
            limit: self.limit,
            spent: inner.spent,
            reserved: inner.outstanding,
            remaining,
            blocked: remaining < self.minimum_operational,
        }
    }
}

/// Reservation capability: the narrow surface handed to the payment
/// pipeline and the state machine. A rejected reserve modifies nothing.
pub trait BudgetReserve: Send + Sync {
    fn reserve(&self, amount: MicroUsdc) -> Result<ReservationHandle, BudgetError>;
    fn commit(&self, handle: ReservationHandle) -> Result<(), BudgetError>;
    fn release(&self, handle: ReservationHandle);
}

/// Read-only capability consumed by guards and the status surface.
pub trait BudgetStatus: Send + Sync {
    fn status(&self) -> BudgetSnapshot;
}

impl BudgetReserve for BudgetLedger {
    fn reserve(&self, amount: MicroUsdc) -> Result<ReservationHandle, BudgetError> {
        let mut inner = self.inner.lock().expect("budget lock");
        let committed = inner
            .spent
            .checked_add(inner.outstanding)
            .and_then(|c| c.checked_add(amount));
        match committed {
            Some(total) if total <= self.limit => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.outstanding = inner
                    .outstanding
                    .checked_add(amount)
                    .expect("outstanding bounded by limit");
                inner.reservations.insert(
                    id,
                    Reservation {
                        amount,
                        state: ReservationState::Outstanding,
                    },
                );
                Ok(ReservationHandle(id))
            }
            _ => {
                let snapshot = self.snapshot_locked(&inner);
                Err(BudgetError::InsufficientFunds {
                    requested: amount,
                    remaining: snapshot.remaining,
                })
            }
        }
    }

    fn commit(&self, handle: ReservationHandle) -> Result<(), BudgetError> {
        let mut inner = self.inner.lock().expect("budget lock");
        let reservation = inner
            .reservations
            .get_mut(&handle.0)
            .ok_or(BudgetError::UnknownReservation(handle.0))?;
        match reservation.state {
            ReservationState::Outstanding => {
                reservation.state = ReservationState::Committed;
                let amount = reservation.amount;
                inner.outstanding = inner.outstanding.saturating_sub(amount);
                inner.spent = inner
                    .spent
                    .checked_add(amount)
                    .expect("spent bounded by limit");
                Ok(())
            }
            // Already settled one way or the other; commit is idempotent.
            ReservationState::Committed => Ok(()),
            ReservationState::Released => Err(BudgetError::UnknownReservation(handle.0)),
        }
    }

    fn release(&self, handle: ReservationHandle) {
        let mut inner = self.inner.lock().expect("budget lock");
        if let Some(reservation) = inner.reservations.get_mut(&handle.0) {
            if reservation.state == ReservationState::Outstanding {
                reservation.state = ReservationState::Released;
                let amount = reservation.amount;
                inner.outstanding = inner.outstanding.saturating_sub(amount);
            }
        }
    }
}

impl BudgetStatus for BudgetLedger {
    fn status(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().expect("budget lock");
        self.snapshot_locked(&inner)
    }
}

impl BudgetLedger {
    /// Administrative reset: spend back to zero, all reservations cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("budget lock");
        inner.spent = MicroUsdc::ZERO;
        inner.outstanding = MicroUsdc::ZERO;
        inner.reservations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> BudgetLedger {
        BudgetLedger::new(MicroUsdc::new(10_000_000), MicroUsdc::new(50_000))
    }

    #[test]
    fn reserve_commit_updates_spend() {
        let ledger = ledger();
        let handle = ledger.reserve(MicroUsdc::new(250_000)).unwrap();
        let status = ledger.status();
        assert_eq!(status.reserved, MicroUsdc::new(250_000));
        assert_eq!(status.spent, MicroUsdc::ZERO);

        ledger.commit(handle).unwrap();
        let status = ledger.status();
        assert_eq!(status.spent, MicroUsdc::new(250_000));
        assert_eq!(status.reserved, MicroUsdc::ZERO);
        assert_eq!(status.remaining, MicroUsdc::new(9_750_000));
    }

    #[test]
    fn rejected_reserve_leaves_state_untouched() {
        let ledger = ledger();
        let before = ledger.status();
        let err = ledger.reserve(MicroUsdc::new(10_000_001)).unwrap_err();
        assert!(matches!(err, crate::errors::BudgetError::InsufficientFunds { .. }));
        assert_eq!(ledger.status(), before);
    }

    #[test]
    fn reservations_count_against_the_limit() {
        let ledger = ledger();
        let _a = ledger.reserve(MicroUsdc::new(6_000_000)).unwrap();
        assert!(ledger.reserve(MicroUsdc::new(5_000_000)).is_err());
        let status = ledger.status();
        assert!(
            status
                .spent
                .checked_add(status.reserved)
                .map(|total| total <= status.limit)
                .unwrap_or(false)
        );
    }

    #[test]
    fn release_returns_the_reservation() {
        let ledger = ledger();
        let handle = ledger.reserve(MicroUsdc::new(1_000_000)).unwrap();
        ledger.release(handle);
        let status = ledger.status();
        assert_eq!(status.reserved, MicroUsdc::ZERO);
        assert_eq!(status.spent, MicroUsdc::ZERO);
        // A released handle cannot be committed later.
        assert!(ledger.commit(handle).is_err());
    }

    #[test]
    fn commit_is_idempotent() {
        let ledger = ledger();
        let handle = ledger.reserve(MicroUsdc::new(500_000)).unwrap();
        ledger.commit(handle).unwrap();
        ledger.commit(handle).unwrap();
        assert_eq!(ledger.status().spent, MicroUsdc::new(500_000));
    }

    #[test]
    fn blocked_below_minimum_operational() {
        let ledger = ledger();
        let handle = ledger.reserve(MicroUsdc::new(9_960_000)).unwrap();
        ledger.commit(handle).unwrap();
        let status = ledger.status();
        assert_eq!(status.remaining, MicroUsdc::new(40_000));
        assert!(status.blocked);
    }

    #[test]
    fn reset_clears_everything() {
        let ledger = ledger();
        let handle = ledger.reserve(MicroUsdc::new(9_000_000)).unwrap();
        ledger.commit(handle).unwrap();
        ledger.reset();
        let status = ledger.status();
        assert_eq!(status.spent, MicroUsdc::ZERO);
        assert_eq!(status.remaining, status.limit);
        assert!(!status.blocked);
    }
}
