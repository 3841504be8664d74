//! Deadline heap with per-instance validity tokens
//!
//! The heap may hold stale entries (cancelled or superseded timers). The
//! `live` map is authoritative: an entry only fires if its sequence number is
//! still the one registered for its instance. Stale entries are skipped when
//! popped and compacted away once they outnumber live ones.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::escalation::InstanceId;

/// Compaction only kicks in above this many heap entries
const COMPACT_MIN_ENTRIES: usize = 64;

/// Opaque handle to one scheduled timer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle {
    pub instance_id: InstanceId,
    pub seq: u64,
}

impl std::fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.instance_id, self.seq)
    }
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    instance_id: InstanceId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of deadlines, at most one live timer per instance
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    live: HashMap<InstanceId, (u64, Instant)>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer, superseding any live timer for the same instance
    pub fn schedule(&mut self, instance_id: &str, deadline: Instant) -> TimerHandle {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.live.insert(instance_id.to_string(), (seq, deadline));
        self.heap.push(Entry {
            deadline,
            seq,
            instance_id: instance_id.to_string(),
        });
        self.maybe_compact();
        TimerHandle {
            instance_id: instance_id.to_string(),
            seq,
        }
    }

    /// Cancel a timer. Returns `false` if it already fired, was cancelled or
    /// was superseded.
    pub fn cancel(&mut self, handle: &TimerHandle) -> bool {
        match self.live.get(&handle.instance_id) {
            Some((seq, _)) if *seq == handle.seq => {
                self.live.remove(&handle.instance_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel whatever timer the instance has
    pub fn cancel_instance(&mut self, instance_id: &str) -> bool {
        self.live.remove(instance_id).is_some()
    }

    pub fn is_pending(&self, handle: &TimerHandle) -> bool {
        matches!(self.live.get(&handle.instance_id), Some((seq, _)) if *seq == handle.seq)
    }

    /// Deadline of the instance's live timer, if any
    pub fn deadline_of(&self, instance_id: &str) -> Option<Instant> {
        self.live.get(instance_id).map(|(_, deadline)| *deadline)
    }

    /// Earliest deadline among live timers
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.is_live_entry(top) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every live timer due at or before `now`, in
    /// deadline order
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerHandle> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if self.is_live_entry(&entry) {
                self.live.remove(&entry.instance_id);
                fired.push(TimerHandle {
                    instance_id: entry.instance_id,
                    seq: entry.seq,
                });
            }
        }
        fired
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Heap entries including stale ones
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Drop every timer
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn is_live_entry(&self, entry: &Entry) -> bool {
        matches!(self.live.get(&entry.instance_id), Some((seq, _)) if *seq == entry.seq)
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() < COMPACT_MIN_ENTRIES || self.heap.len() < self.live.len() * 2 {
            return;
        }
        let entries = std::mem::take(&mut self.heap).into_vec();
        let live = &self.live;
        self.heap = entries
            .into_iter()
            .filter(|e| matches!(live.get(&e.instance_id), Some((seq, _)) if *seq == e.seq))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pops_in_deadline_order() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule("c", base + Duration::from_secs(30));
        q.schedule("a", base + Duration::from_secs(10));
        q.schedule("b", base + Duration::from_secs(20));

        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(10)));
        let fired: Vec<String> = q
            .pop_expired(base + Duration::from_secs(25))
            .into_iter()
            .map(|h| h.instance_id)
            .collect();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel_twice_is_noop() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        let h = q.schedule("x", base + Duration::from_secs(5));
        assert!(q.cancel(&h));
        assert!(!q.cancel(&h));
        assert!(!q.cancel(&h));
        assert!(q.pop_expired(base + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        let h = q.schedule("x", base);
        assert_eq!(q.pop_expired(base), vec![h.clone()]);
        assert!(!q.cancel(&h));
        assert!(!q.is_pending(&h));
    }

    #[test]
    fn test_reschedule_supersedes_previous_handle() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        let first = q.schedule("x", base + Duration::from_secs(5));
        let second = q.schedule("x", base + Duration::from_secs(50));
        assert!(!q.is_pending(&first));
        assert!(q.is_pending(&second));
        assert_eq!(q.len(), 1);

        assert!(q.pop_expired(base + Duration::from_secs(10)).is_empty());
        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(50)));
        assert!(!q.cancel(&first));
        assert!(q.cancel(&second));
    }

    #[test]
    fn test_same_deadline_fires_in_schedule_order() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule("first", base);
        q.schedule("second", base);
        let fired: Vec<String> = q.pop_expired(base).into_iter().map(|h| h.instance_id).collect();
        assert_eq!(fired, vec!["first", "second"]);
    }

    #[test]
    fn test_compaction_drops_stale_entries() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        for i in 0..200 {
            q.schedule("churn", base + Duration::from_secs(i));
        }
        assert_eq!(q.len(), 1);
        assert!(q.heap_len() < 200);
        assert_eq!(q.deadline_of("churn"), Some(base + Duration::from_secs(199)));
    }

    #[test]
    fn test_clear_drops_everything() {
        let base = Instant::now();
        let mut q = TimerQueue::new();
        let h = q.schedule("x", base);
        q.clear();
        assert!(q.is_empty());
        assert!(!q.is_pending(&h));
        assert_eq!(q.next_deadline(), None);
    }
}
