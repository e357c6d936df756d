//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Next identifier handed out by [`FiberId::next`]. Zero is reserved.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber
///
/// Identifiers come from a process-wide monotonic counter and are never
/// reused, so a stale id can not alias a newer fiber. The value 0 is
/// reserved as a sentinel for "no fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Allocate a fresh identifier
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a valid fiber ID
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<FiberId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(id.is_some());
        assert_eq!(id.to_option(), Some(id));
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_fiber_id_none() {
        let none = FiberId::default();
        assert!(none.is_none());
        assert_eq!(none.to_option(), None);
        assert_eq!(format!("{:?}", none), "FiberId(NONE)");
    }

    #[test]
    fn test_next_is_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..256).map(|_| FiberId::next()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(id.is_some());
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1024);
    }
}
