//! Lifetime reference counts for controllers and devices.
//!
//! Every asynchronous operation that must keep an object alive carries a
//! [`Hold`]. Dropping the hold is the decrement, so "released exactly once
//! on every completion path" follows from ownership.

use alloc::sync::Arc;

/// The creation reference of an object.
#[derive(Debug)]
pub struct RefCount {
    token: Arc<()>,
}

/// One outstanding reference.
#[derive(Debug)]
pub struct Hold {
    _token: Arc<()>,
}

impl RefCount {
    pub fn new() -> Self {
        Self { token: Arc::new(()) }
    }

    pub fn hold(&self) -> Hold {
        Hold {
            _token: Arc::clone(&self.token),
        }
    }

    /// Current count, including the creation reference.
    pub fn count(&self) -> usize {
        Arc::strong_count(&self.token)
    }

    /// Only the creation reference remains.
    pub fn is_idle(&self) -> bool {
        self.count() == 1
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_counts() {
        let refs = RefCount::new();
        assert_eq!(refs.count(), 1);
        let a = refs.hold();
        let b = refs.hold();
        assert_eq!(refs.count(), 3);
        drop(a);
        assert_eq!(refs.count(), 2);
        drop(b);
        assert!(refs.is_idle());
    }
}
