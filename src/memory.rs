use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use crate::error::ExecError;

/// Tracks the bytes held by the tables of one execution against an optional quota.
///
/// Shared between all operators, so every update is a single atomic operation.
#[derive(Debug, Default)]
pub struct Allocator {
    allocated: AtomicU64,
    peak: AtomicU64,
    limit: Option<u64>,
}

impl Allocator {
    pub fn new(limit: Option<u64>) -> Arc<Allocator> {
        Arc::new(Allocator { allocated: AtomicU64::new(0), peak: AtomicU64::new(0), limit })
    }

    pub fn unlimited() -> Arc<Allocator> {
        Allocator::new(None)
    }

    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation, ExecError> {
        let limit = self.limit.unwrap_or(u64::MAX);
        let prev = self.allocated.fetch_update(Ordering::AcqRel, Ordering::Acquire,
            |x| x.checked_add(bytes).filter(|total| *total <= limit))
            .map_err(|current| ExecError::ResourceExhausted(format!(
                "memory quota of {} bytes exceeded: {} bytes in use, {} bytes requested",
                limit, current, bytes)))?;
        self.peak.fetch_max(prev + bytes, Ordering::AcqRel);
        Ok(Reservation { allocator: self.clone(), bytes })
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn max_allocated(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    fn free(&self, bytes: u64) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Bytes held against an [`Allocator`]. Dropping it gives them back.
#[derive(Debug)]
pub struct Reservation {
    allocator: Arc<Allocator>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocator.free(self.bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let alloc = Allocator::new(Some(100));
        let a = alloc.reserve(60).unwrap();
        assert_eq!(alloc.allocated(), 60);
        let err = alloc.reserve(41).unwrap_err();
        assert!(err.is_resource_exhausted());
        let b = alloc.reserve(40).unwrap();
        assert_eq!(alloc.allocated(), 100);
        drop(a);
        drop(b);
        assert_eq!(alloc.allocated(), 0);
        assert_eq!(alloc.max_allocated(), 100);
    }

    #[test]
    fn test_concurrent_reservations() {
        let alloc = Allocator::unlimited();
        let handles: Vec<_> = (0..8).map(|_| {
            let alloc = alloc.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let r = alloc.reserve(16).unwrap();
                    drop(r);
                }
            })
        }).collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(alloc.allocated(), 0);
        assert!(alloc.max_allocated() >= 16);
    }
}
