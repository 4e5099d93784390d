use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ClientError;
use crate::gateway::events::DispatchEvent;

type ProcessorNotify = Arc<dyn Fn() + Send + Sync>;

struct SequencerState {
    slots: Vec<Option<DispatchEvent>>,
    /// Ring index where sequence `last_sequence + 1` lands.
    push_cursor: usize,
    /// Ring index of the next frame `pull` hands out.
    pull_cursor: usize,
    last_sequence: u64,
    received_first: bool,
    /// Occupied slots, released and buffered alike.
    size: usize,
}

/// Bounded, sequence-aware reordering buffer.
///
/// The transport may redeliver or reorder DISPATCH frames around a resume;
/// this buffer releases them to a single consumer strictly in sequence
/// order, dropping duplicates. A gap at `last_sequence + 1` holds back
/// everything after it until the missing frame arrives or `reset` declares
/// it lost. Capacity must be provisioned for the worst-case out-of-order
/// window: running out of slots is a fatal error, not a silent drop.
pub struct DispatchSequencer {
    state: Mutex<SequencerState>,
    notify: Mutex<Option<ProcessorNotify>>,
}

impl DispatchSequencer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "sequencer capacity must be non-zero");
        Self {
            state: Mutex::new(SequencerState {
                slots: (0..capacity).map(|_| None).collect(),
                push_cursor: 0,
                pull_cursor: 0,
                last_sequence: 0,
                received_first: false,
                size: 0,
            }),
            notify: Mutex::new(None),
        }
    }

    /// Register the downstream processor. Notification is edge-triggered,
    /// once per released frame; the processor drains via `pull`.
    pub fn set_processor<F: Fn() + Send + Sync + 'static>(&self, notify: F) {
        *lock(&self.notify) = Some(Arc::new(notify));
    }

    /// Accept one frame. Returns how many frames became deliverable, or an
    /// overflow error when the out-of-order window exceeds capacity.
    pub fn push(&self, event: DispatchEvent) -> Result<u64, ClientError> {
        let released = {
            let mut state = lock(&self.state);
            let capacity = state.slots.len();

            if !state.received_first {
                state.received_first = true;
                state.last_sequence = event.sequence.saturating_sub(1);
            }

            // Anything at or below last_sequence was already delivered.
            if event.sequence <= state.last_sequence {
                tracing::trace!(seq = event.sequence, "duplicate frame dropped");
                return Ok(0);
            }

            let offset = (event.sequence - state.last_sequence - 1) as usize;
            if offset >= capacity || state.size + 1 > capacity {
                return Err(ClientError::SequencerOverflow {
                    capacity,
                    sequence: event.sequence,
                });
            }

            let index = (state.push_cursor + offset) % capacity;
            if state.slots[index].is_some() {
                tracing::trace!(seq = event.sequence, "frame already buffered");
                return Ok(0);
            }
            state.slots[index] = Some(event);
            state.size += 1;

            let mut released = 0u64;
            if offset == 0 {
                released = advance_contiguous(&mut state);
            }
            released
        };

        self.notify_processor(released);
        Ok(released)
    }

    /// Remove and return the next released frame, or `None` at a gap.
    pub fn pull(&self) -> Option<DispatchEvent> {
        let mut state = lock(&self.state);
        let releasable = matches!(
            &state.slots[state.pull_cursor],
            Some(frame) if frame.sequence <= state.last_sequence
        );
        if !releasable {
            return None;
        }
        let cursor = state.pull_cursor;
        let frame = state.slots[cursor].take();
        state.size -= 1;
        state.pull_cursor = (cursor + 1) % state.slots.len();
        frame
    }

    /// Invoked on resume/reconnect: sequences still missing at this point
    /// are permanently lost, so buffered frames are compacted forward over
    /// the gaps and released, `last_sequence` becomes the highest sequence
    /// now contiguous, and the next `push` re-seeds the baseline.
    pub fn reset(&self) {
        let released = {
            let mut state = lock(&self.state);
            let capacity = state.slots.len();

            let mut buffered = Vec::new();
            for i in 0..capacity {
                let index = (state.push_cursor + i) % capacity;
                let is_future = matches!(
                    &state.slots[index],
                    Some(frame) if frame.sequence > state.last_sequence
                );
                if is_future {
                    if let Some(frame) = state.slots[index].take() {
                        buffered.push(frame);
                    }
                }
            }

            if !buffered.is_empty() {
                tracing::warn!(
                    frames = buffered.len(),
                    last_seq = state.last_sequence,
                    "closing sequence gaps after reset, missing frames are lost"
                );
            }

            let released = buffered.len() as u64;
            for frame in buffered {
                let cursor = state.push_cursor;
                state.last_sequence = frame.sequence;
                state.slots[cursor] = Some(frame);
                state.push_cursor = (cursor + 1) % capacity;
            }

            state.received_first = false;
            released
        };

        self.notify_processor(released);
    }

    pub fn last_sequence(&self) -> u64 {
        lock(&self.state).last_sequence
    }

    pub fn len(&self) -> usize {
        lock(&self.state).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify_processor(&self, released: u64) {
        if released == 0 {
            return;
        }
        let notify = lock(&self.notify).clone();
        if let Some(notify) = notify {
            for _ in 0..released {
                notify();
            }
        }
    }
}

/// Walk released frames forward from the push cursor while the next
/// expected sequence is buffered. Released frames stay in their slots for
/// `pull`; only the cursors and `last_sequence` move.
fn advance_contiguous(state: &mut SequencerState) -> u64 {
    let capacity = state.slots.len();
    let mut released = 0;
    loop {
        let next = matches!(
            &state.slots[state.push_cursor],
            Some(frame) if frame.sequence == state.last_sequence + 1
        );
        if !next {
            break;
        }
        state.last_sequence += 1;
        state.push_cursor = (state.push_cursor + 1) % capacity;
        released += 1;
    }
    released
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(seq: u64) -> DispatchEvent {
        DispatchEvent {
            sequence: seq,
            event_type: "message.create".to_string(),
            data: json!({ "seq": seq }),
        }
    }

    fn drain(q: &DispatchSequencer) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(f) = q.pull() {
            out.push(f.sequence);
        }
        out
    }

    #[test]
    fn test_in_order_release() {
        let q = DispatchSequencer::new(8);
        for seq in 1..=3 {
            assert_eq!(q.push(frame(seq)).unwrap(), 1);
        }
        assert_eq!(drain(&q), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_gap_blocks_until_filled() {
        let q = DispatchSequencer::new(8);
        q.push(frame(1)).unwrap();
        q.push(frame(2)).unwrap();
        q.push(frame(3)).unwrap();
        assert_eq!(q.push(frame(6)).unwrap(), 0);
        assert_eq!(drain(&q), vec![1, 2, 3]);

        // 4 releases only itself; 5 releases itself and the buffered 6
        assert_eq!(q.push(frame(4)).unwrap(), 1);
        assert_eq!(q.push(frame(5)).unwrap(), 2);
        assert_eq!(drain(&q), vec![4, 5, 6]);
    }

    #[test]
    fn test_first_push_seeds_baseline() {
        let q = DispatchSequencer::new(8);
        assert_eq!(q.push(frame(40)).unwrap(), 1);
        assert_eq!(q.last_sequence(), 40);
        assert_eq!(drain(&q), vec![40]);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let q = DispatchSequencer::new(8);
        q.push(frame(1)).unwrap();
        q.push(frame(2)).unwrap();
        assert_eq!(drain(&q), vec![1, 2]);

        assert_eq!(q.push(frame(1)).unwrap(), 0);
        assert_eq!(q.push(frame(2)).unwrap(), 0);
        assert_eq!(q.len(), 0);
        assert!(q.pull().is_none());

        // duplicate of a buffered-but-unreleased frame
        q.push(frame(4)).unwrap();
        assert_eq!(q.push(frame(4)).unwrap(), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let q = DispatchSequencer::new(4);
        q.push(frame(1)).unwrap();
        // leave 2 missing; buffer 3, 4 — together with the unpulled 1 the
        // ring holds 3 of 4 slots
        q.push(frame(3)).unwrap();
        q.push(frame(4)).unwrap();
        q.push(frame(2)).unwrap();
        // 1..4 now occupy every slot; a fifth distinct sequence overflows
        let err = q.push(frame(5)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::SequencerOverflow { capacity: 4, sequence: 5 }
        ));
    }

    #[test]
    fn test_far_future_sequence_overflows() {
        let q = DispatchSequencer::new(4);
        q.push(frame(1)).unwrap();
        let err = q.push(frame(10)).unwrap_err();
        assert!(matches!(err, ClientError::SequencerOverflow { .. }));
    }

    #[test]
    fn test_reset_closes_gaps_and_releases() {
        let q = DispatchSequencer::new(8);
        q.push(frame(1)).unwrap();
        q.push(frame(3)).unwrap();
        q.push(frame(5)).unwrap();
        q.push(frame(6)).unwrap();
        assert_eq!(drain(&q), vec![1]);

        // 2 and 4 are lost for good; reset must hand out 3, 5, 6
        q.reset();
        assert_eq!(drain(&q), vec![3, 5, 6]);
        assert_eq!(q.last_sequence(), 6);
    }

    #[test]
    fn test_reset_reseeds_baseline_on_next_push() {
        let q = DispatchSequencer::new(8);
        q.push(frame(5)).unwrap();
        assert_eq!(drain(&q), vec![5]);
        q.reset();

        // after a resume the server may restart numbering
        assert_eq!(q.push(frame(100)).unwrap(), 1);
        assert_eq!(drain(&q), vec![100]);
    }

    #[test]
    fn test_reset_on_fresh_queue_is_idempotent() {
        let q = DispatchSequencer::new(8);
        q.reset();
        assert_eq!(q.last_sequence(), 0);
        assert!(q.is_empty());
        // the first push still seeds the baseline
        assert_eq!(q.push(frame(9)).unwrap(), 1);
        assert_eq!(drain(&q), vec![9]);
    }

    #[test]
    fn test_wrap_around_with_backlogged_consumer() {
        let q = DispatchSequencer::new(4);
        for seq in 1..=4 {
            q.push(frame(seq)).unwrap();
        }
        // consumer drains two, producer keeps going around the ring
        assert_eq!(q.pull().unwrap().sequence, 1);
        assert_eq!(q.pull().unwrap().sequence, 2);
        q.push(frame(5)).unwrap();
        q.push(frame(6)).unwrap();
        assert_eq!(drain(&q), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_processor_notified_once_per_released_frame() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let q = DispatchSequencer::new(8);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        q.set_processor(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        q.push(frame(2)).unwrap();
        q.push(frame(3)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // a buffered frame notifies only when it becomes contiguous
        q.push(frame(5)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        q.push(frame(4)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
