//! Cancellation token for timed I/O operations
//!
//! A parked I/O operation and its timeout timer share one token. The
//! first party to set it wins: either the timer cancels the wait with
//! `ETIMEDOUT`, or the readiness path resumes the fiber and the timer
//! finds the token already claimed (or dropped). The compare-exchange
//! makes the race exclusive.

use core::sync::atomic::{AtomicI32, Ordering};

/// Write-once errno cell shared via `Arc`/`Weak`
#[derive(Debug, Default)]
pub struct CancelToken {
    code: AtomicI32,
}

impl CancelToken {
    /// Create an unset token
    #[inline]
    pub const fn new() -> Self {
        CancelToken {
            code: AtomicI32::new(0),
        }
    }

    /// Claim the token with an errno. Returns true if this call won
    /// the race, false if some other party already claimed it.
    ///
    /// `code` must be non-zero; zero means "unset".
    #[inline]
    pub fn cancel(&self, code: i32) -> bool {
        debug_assert!(code != 0);
        self.code
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The errno this token was claimed with, if any
    #[inline]
    pub fn code(&self) -> Option<i32> {
        match self.code.load(Ordering::Acquire) {
            0 => None,
            c => Some(c),
        }
    }

    /// Whether the token has been claimed
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.code.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_claim_wins() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(t.cancel(110));
        assert!(!t.cancel(4));
        assert_eq!(t.code(), Some(110));
    }

    #[test]
    fn claim_race_is_exclusive() {
        for _ in 0..50 {
            let token = Arc::new(CancelToken::new());
            let a = Arc::clone(&token);
            let b = Arc::clone(&token);
            let ha = thread::spawn(move || a.cancel(110));
            let hb = thread::spawn(move || b.cancel(125));
            let won_a = ha.join().unwrap();
            let won_b = hb.join().unwrap();
            assert!(won_a ^ won_b);
            let code = token.code().unwrap();
            assert!(code == 110 || code == 125);
        }
    }

    #[test]
    fn weak_guard_drops() {
        let token = Arc::new(CancelToken::new());
        let weak = Arc::downgrade(&token);
        drop(token);
        assert!(weak.upgrade().is_none());
    }
}
