use std::sync::atomic::{AtomicI64, Ordering};

/// Bitcake held by one servent. There is no floor, a balance may go negative.
#[derive(Debug)]
pub struct BitcakeManager {
    balance: AtomicI64,
}

impl BitcakeManager {
    pub fn new(initial: i64) -> Self {
        BitcakeManager {
            balance: AtomicI64::new(initial),
        }
    }

    pub fn take(&self, amount: i64) {
        self.balance.fetch_sub(amount, Ordering::SeqCst);
    }

    pub fn add(&self, amount: i64) {
        self.balance.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn current(&self) -> i64 {
        self.balance.load(Ordering::SeqCst)
    }
}
