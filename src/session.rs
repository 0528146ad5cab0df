use std::sync::atomic::{AtomicU32, Ordering};

/// Per-role STAMP sequence counter.
///
/// Shared by every CPU running the packet path. Values start at zero and wrap
/// at `u32::MAX` like the wire field.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    curr_seq: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter {
            curr_seq: AtomicU32::new(0),
        }
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> u32 {
        self.curr_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of sequence numbers handed out so far (modulo 2^32).
    pub fn issued(&self) -> u32 {
        self.curr_seq.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_sequence_starts_at_zero() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.issued(), 2);
    }

    #[test]
    fn test_concurrent_sequence_numbers_are_unique() {
        let counter = Arc::new(SequenceCounter::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            let values = worker.join().unwrap();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(seen.insert(v), "duplicate sequence number {}", v);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(seen.iter().max(), Some(&7999));
    }
}
