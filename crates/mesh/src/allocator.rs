//! Keyed identifier allocators for tunnel and segment-routing mechanisms.
//!
//! Both allocators hand out identifiers from a bounded numeric space. An
//! allocation is keyed: asking twice for the same key returns the same value,
//! and two distinct keys never share a value while both are held.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;
use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::MeshError;

/// Largest VXLAN network identifier (24 bits).
pub const MAX_VNI: u32 = 0x00FF_FFFF;

// ---------------------------------------------------------------------------
// Generic pool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Pool {
    range: RangeInclusive<u32>,
    cursor: u32,
    by_key: HashMap<String, u32>,
    in_use: HashSet<u32>,
}

impl Pool {
    fn new(range: RangeInclusive<u32>) -> Self {
        Self {
            cursor: *range.start(),
            range,
            by_key: HashMap::new(),
            in_use: HashSet::new(),
        }
    }

    fn capacity(&self) -> u64 {
        u64::from(*self.range.end()) - u64::from(*self.range.start()) + 1
    }

    fn allocate(&mut self, key: &str) -> Option<u32> {
        if let Some(&value) = self.by_key.get(key) {
            return Some(value);
        }
        if self.in_use.len() as u64 >= self.capacity() {
            return None;
        }
        loop {
            let candidate = self.cursor;
            self.cursor = if candidate == *self.range.end() {
                *self.range.start()
            } else {
                candidate + 1
            };
            if self.in_use.insert(candidate) {
                self.by_key.insert(key.to_string(), candidate);
                return Some(candidate);
            }
        }
    }

    fn release(&mut self, key: &str) -> Option<u32> {
        let value = self.by_key.remove(key)?;
        self.in_use.remove(&value);
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// VNI
// ---------------------------------------------------------------------------

/// Allocates VXLAN network identifiers for unordered pairs of tunnel endpoints.
#[derive(Debug)]
pub struct VniAllocator {
    pool: Mutex<Pool>,
}

impl Default for VniAllocator {
    fn default() -> Self {
        Self::with_range(1..=MAX_VNI)
    }
}

impl VniAllocator {
    /// Creates an allocator over a custom range. Used by tests to exercise
    /// exhaustion.
    pub fn with_range(range: RangeInclusive<u32>) -> Self {
        Self {
            pool: Mutex::new(Pool::new(range)),
        }
    }

    fn pair_key(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}|{b}")
        } else {
            format!("{b}|{a}")
        }
    }

    /// Returns the identifier for the pair `(a, b)`; `(b, a)` yields the same.
    pub fn vni(&self, a: &str, b: &str) -> Result<u32, MeshError> {
        self.pool
            .lock()
            .allocate(&Self::pair_key(a, b))
            .ok_or_else(|| MeshError::selection("VNI space exhausted"))
    }

    /// Frees the identifier held by the pair, if any.
    pub fn release(&self, a: &str, b: &str) -> Option<u32> {
        self.pool.lock().release(&Self::pair_key(a, b))
    }
}

// ---------------------------------------------------------------------------
// SID
// ---------------------------------------------------------------------------

/// Allocates SRv6 segment identifiers keyed by connection id.
#[derive(Debug)]
pub struct SidAllocator {
    prefix: Ipv6Addr,
    pool: Mutex<Pool>,
}

impl Default for SidAllocator {
    fn default() -> Self {
        Self::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0))
    }
}

impl SidAllocator {
    /// Creates an allocator whose SIDs live under `prefix` (upper 96 bits).
    pub fn new(prefix: Ipv6Addr) -> Self {
        Self {
            prefix,
            pool: Mutex::new(Pool::new(1..=u32::MAX)),
        }
    }

    /// Returns the SID for `key`, formatted as an IPv6 address.
    pub fn sid(&self, key: &str) -> Result<String, MeshError> {
        let index = self
            .pool
            .lock()
            .allocate(key)
            .ok_or_else(|| MeshError::selection("SID space exhausted"))?;
        let base = u128::from(self.prefix) & !u128::from(u32::MAX);
        Ok(Ipv6Addr::from(base | u128::from(index)).to_string())
    }

    /// Frees the SID held by `key`, if any.
    pub fn release(&self, key: &str) -> Option<u32> {
        self.pool.lock().release(key)
    }
}
