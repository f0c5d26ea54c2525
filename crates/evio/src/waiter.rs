//! Per-direction waiter slots.

use evio_core::{Error, Result};
use std::cell::Cell;
use std::rc::Rc;

/// Marks a direction (read, write, accept) as having a pending operation
/// that runs on the loop thread. The slot is released when the guard
/// drops, including when the operation's future is dropped mid-flight.
pub(crate) struct Waiter<'a> {
    slot: &'a Cell<bool>,
}

impl<'a> Waiter<'a> {
    /// Claim `slot`, or fail with [`Error::Busy`] if it is taken.
    pub(crate) fn claim(slot: &'a Cell<bool>) -> Result<Self> {
        if slot.replace(true) {
            return Err(Error::Busy);
        }
        Ok(Self { slot })
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.slot.set(false);
    }
}

/// Slots held for work on the pool. Clones share one claim, and the slots
/// are released when the last clone drops. An operation parks a clone
/// with each job it submits, so dropping the operation leaves the slots
/// taken until that job is reaped.
#[derive(Clone)]
pub(crate) struct JobClaim(Rc<Held>);

struct Held(Vec<Rc<Cell<bool>>>);

impl JobClaim {
    /// Claim every slot in `slots`, or none of them.
    pub(crate) fn claim(slots: &[&Rc<Cell<bool>>]) -> Result<Self> {
        if slots.iter().any(|s| s.get()) {
            return Err(Error::Busy);
        }
        for s in slots {
            s.set(true);
        }
        Ok(Self(Rc::new(Held(slots.iter().map(|s| Rc::clone(s)).collect()))))
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        for s in &self.0 {
            s.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_drop() {
        let slot = Cell::new(false);
        let w = Waiter::claim(&slot).unwrap();
        assert!(matches!(Waiter::claim(&slot), Err(Error::Busy)));
        assert!(slot.get());
        drop(w);
        assert!(!slot.get());
        assert!(Waiter::claim(&slot).is_ok());
    }

    #[test]
    fn test_job_claim_held_by_last_clone() {
        let a = Rc::new(Cell::new(false));
        let b = Rc::new(Cell::new(false));
        let claim = JobClaim::claim(&[&a, &b]).unwrap();
        let parked = claim.clone();
        assert!(matches!(JobClaim::claim(&[&b]), Err(Error::Busy)));
        drop(claim);
        assert!(a.get() && b.get());
        drop(parked);
        assert!(!a.get() && !b.get());
    }

    #[test]
    fn test_job_claim_is_all_or_nothing() {
        let a = Rc::new(Cell::new(false));
        let b = Rc::new(Cell::new(true));
        assert!(matches!(JobClaim::claim(&[&a, &b]), Err(Error::Busy)));
        assert!(!a.get());
    }
}
