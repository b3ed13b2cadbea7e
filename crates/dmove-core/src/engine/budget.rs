//! Memory budget shared by every task the engine admits.
//!
//! Tasks reserve their memory cost before they run and release what they
//! still hold after they finish, so `left` returns to `max` once the engine
//! has drained. Network and continuation tasks reserve unconditionally and may
//! drive `left` below zero; disk tasks are gated by [`MemoryBudget::try_admit`].

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
pub struct MemoryBudget {
    max: i64,
    left: AtomicI64,
}

impl MemoryBudget {
    pub fn new(max: u64) -> Self {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        Self {
            max,
            left: AtomicI64::new(max),
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Memory not currently reserved. Negative while unconditional
    /// reservations exceed the budget.
    pub fn left(&self) -> i64 {
        self.left.load(Ordering::Acquire)
    }

    /// Reserve `cost` regardless of what is left.
    pub fn reserve(&self, cost: u64) {
        if cost > 0 {
            self.left.fetch_sub(to_i64(cost), Ordering::AcqRel);
        }
    }

    /// Reserve `cost` if it fits. A zero cost always fits; a cost larger than
    /// the whole budget fits only when nothing else is reserved.
    pub fn try_admit(&self, cost: u64) -> bool {
        if cost == 0 {
            return true;
        }
        let cost = to_i64(cost);
        let mut current = self.left.load(Ordering::Acquire);
        loop {
            let fits = cost <= current || (cost > self.max && current == self.max);
            if !fits {
                return false;
            }
            match self.left.compare_exchange_weak(
                current,
                current - cost,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `amount` to the budget.
    pub fn release(&self, amount: u64) {
        if amount > 0 {
            self.left.fetch_add(to_i64(amount), Ordering::AcqRel);
        }
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
