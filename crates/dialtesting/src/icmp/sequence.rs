use std::sync::atomic::{AtomicU16, Ordering};

/// Echo identifier and sequence numbers shared by every probe of a process.
#[derive(Debug)]
pub struct IcmpSequencer {
    id: u16,
    seq: AtomicU16,
}

impl IcmpSequencer {
    pub fn new() -> Self {
        Self::with_id(rand::random())
    }

    pub fn with_id(id: u16) -> Self {
        Self { id, seq: AtomicU16::new(0) }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Next sequence number. Wraps at `u16::MAX`.
    pub fn next_sequence(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IcmpSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_increases() {
        let seq = IcmpSequencer::with_id(7);
        assert_eq!(seq.next_sequence(), 0);
        assert_eq!(seq.next_sequence(), 1);
        assert_eq!(seq.id(), 7);
    }

    #[test]
    fn test_concurrent_callers_get_distinct_numbers() {
        let seq = Arc::new(IcmpSequencer::with_id(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..100).map(|_| seq.next_sequence()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for n in handle.join().unwrap() {
                assert!(seen.insert(n));
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
