use std::collections::BTreeMap;

/// Re-orders bulk-read completions back into submission order.
///
/// Reads are tagged with a monotonically increasing sequence number at
/// submission ([`issue`](Self::issue)). The underlying transport may complete
/// them in any order; [`complete`](Self::complete) parks completions that
/// arrive ahead of the watermark and releases a contiguous run as soon as the
/// gap fills. The watermark (`last_complete`) never passes an in-flight
/// sequence number that has not completed.
#[derive(Debug)]
pub struct SequenceReorderer<T> {
    next_seq: u64,
    last_complete: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> Default for SequenceReorderer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequenceReorderer<T> {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            last_complete: 0,
            parked: BTreeMap::new(),
        }
    }

    /// Tag a read about to be submitted.
    pub fn issue(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a completion. Returns every item now deliverable, in order.
    pub fn complete(&mut self, seq: u64, item: T) -> Vec<T> {
        debug_assert!(seq > self.last_complete, "completion behind watermark");
        debug_assert!(seq < self.next_seq, "completion never issued");

        if seq != self.last_complete + 1 {
            self.parked.insert(seq, item);
            return Vec::new();
        }

        let mut ready = vec![item];
        self.last_complete = seq;
        while let Some(next) = self.parked.remove(&(self.last_complete + 1)) {
            self.last_complete += 1;
            ready.push(next);
        }
        ready
    }

    /// Completions parked ahead of the watermark.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn last_complete(&self) -> u64 {
        self.last_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_completions_pass_through() {
        let mut reorder = SequenceReorderer::new();
        let a = reorder.issue();
        let b = reorder.issue();

        assert_eq!(reorder.complete(a, "a"), vec!["a"]);
        assert_eq!(reorder.complete(b, "b"), vec!["b"]);
        assert_eq!(reorder.parked_len(), 0);
    }

    #[test]
    fn late_gap_releases_parked_run() {
        // Completion order 1, 3, 2 must deliver as 1, then 2 and 3 together.
        let mut reorder = SequenceReorderer::new();
        let s1 = reorder.issue();
        let s2 = reorder.issue();
        let s3 = reorder.issue();

        assert_eq!(reorder.complete(s1, 1), vec![1]);
        assert_eq!(reorder.complete(s3, 3), Vec::<i32>::new());
        assert_eq!(reorder.parked_len(), 1);
        assert_eq!(reorder.complete(s2, 2), vec![2, 3]);
        assert_eq!(reorder.parked_len(), 0);
        assert_eq!(reorder.last_complete(), 3);
    }

    #[test]
    fn fully_reversed_arrival() {
        let mut reorder = SequenceReorderer::new();
        let seqs: Vec<u64> = (0..5).map(|_| reorder.issue()).collect();

        for &seq in seqs[1..].iter().rev() {
            assert!(reorder.complete(seq, seq).is_empty());
        }
        assert_eq!(reorder.complete(seqs[0], seqs[0]), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn any_arrival_order_yields_identical_output() {
        // Exhaustively permute four completions; the released order is always
        // the submission order.
        let permutations = [
            [1u64, 2, 3, 4],
            [1, 2, 4, 3],
            [2, 1, 3, 4],
            [4, 3, 2, 1],
            [3, 1, 4, 2],
            [2, 4, 1, 3],
        ];
        for arrival in permutations {
            let mut reorder = SequenceReorderer::new();
            for _ in 0..4 {
                reorder.issue();
            }
            let mut released = Vec::new();
            for seq in arrival {
                released.extend(reorder.complete(seq, seq));
            }
            assert_eq!(released, vec![1, 2, 3, 4], "arrival order {arrival:?}");
        }
    }
}
