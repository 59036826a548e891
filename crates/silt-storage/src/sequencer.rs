//! Per-stream reordering of WAL acknowledgements into offset order.
//!
//! The WAL assigns total offsets but delivers acknowledgements in
//! arbitrary order across streams. Clients require per-stream
//! offset-ordered completion, so all reordering is localized here: each
//! active stream keeps an in-order queue of its in-flight requests, and
//! an acknowledgement pops the maximal persisted prefix. State is
//! sharded across lock stripes keyed by `stream_id % stripes`; the hot
//! path touches exactly one stripe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use silt_core::error::StorageResult;

use crate::append::WriteRequest;
use crate::wal::WalAppendHandle;

struct StreamQueue {
    pending: Vec<Arc<WriteRequest>>,
    /// Last popped WAL offset for this stream.
    confirm: Option<u64>,
}

impl StreamQueue {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            confirm: None,
        }
    }

    /// Safe confirm bound: strictly below every unacknowledged offset.
    fn confirm_bound(&self) -> Option<u64> {
        match self.pending.first().and_then(|r| r.wal_offset()) {
            Some(head) => head.checked_sub(1),
            None => self.confirm,
        }
    }
}

#[derive(Default)]
struct Global {
    /// Highest offset ever popped, across all streams.
    max_popped: Option<u64>,
}

/// Reorders out-of-order WAL acknowledgements into per-stream offset
/// order.
pub struct CallbackSequencer {
    stripes: Vec<Mutex<HashMap<u64, StreamQueue>>>,
    global: Mutex<Global>,
}

impl CallbackSequencer {
    /// Sequencer with the given number of lock stripes.
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            global: Mutex::new(Global::default()),
        }
    }

    fn stripe(&self, stream_id: u64) -> &Mutex<HashMap<u64, StreamQueue>> {
        &self.stripes[(stream_id % self.stripes.len() as u64) as usize]
    }

    /// Submits the WAL append and registers the request on its stream's
    /// queue under one stripe acquisition, so registration order equals
    /// WAL offset order even with concurrent writers on the stream.
    ///
    /// # Errors
    ///
    /// Propagates the device's append error; nothing is registered on
    /// failure.
    pub fn submit(
        &self,
        request: &Arc<WriteRequest>,
        append: impl FnOnce() -> StorageResult<WalAppendHandle>,
    ) -> StorageResult<WalAppendHandle> {
        let mut stripe = self.stripe(request.stream_id()).lock();
        let handle = append()?;
        request.set_wal_offset(handle.offset);
        let queue = stripe
            .entry(request.stream_id())
            .or_insert_with(StreamQueue::new);
        debug_assert!(queue
            .pending
            .last()
            .and_then(|r| r.wal_offset())
            .map_or(true, |last| last < handle.offset));
        queue.pending.push(Arc::clone(request));
        Ok(handle)
    }

    /// Marks the request persisted; when it unblocks the head of its
    /// stream's queue, pops and returns the maximal persisted prefix in
    /// offset order.
    pub fn after(&self, request: &Arc<WriteRequest>) -> Vec<Arc<WriteRequest>> {
        self.after_with(request, <[Arc<WriteRequest>]>::to_vec)
    }

    /// Like [`Self::after`], but hands the popped prefix to `f` while the
    /// stream's stripe is still held, so the caller's cache insertion
    /// order cannot interleave with another acknowledgement on the same
    /// stream.
    pub fn after_with<R>(
        &self,
        request: &Arc<WriteRequest>,
        f: impl FnOnce(&[Arc<WriteRequest>]) -> R,
    ) -> R {
        request.mark_persisted();

        let mut stripe = self.stripe(request.stream_id()).lock();
        let Some(queue) = stripe.get_mut(&request.stream_id()) else {
            return f(&[]);
        };
        if !queue.pending.first().map_or(false, |r| r.is_persisted()) {
            return f(&[]);
        }

        let split = queue
            .pending
            .iter()
            .position(|r| !r.is_persisted())
            .unwrap_or(queue.pending.len());
        let popped: Vec<Arc<WriteRequest>> = queue.pending.drain(..split).collect();
        if let Some(last) = popped.last().and_then(|r| r.wal_offset()) {
            queue.confirm = Some(last);
            let mut global = self.global.lock();
            if global.max_popped.map_or(true, |max| last > max) {
                global.max_popped = Some(last);
            }
        }
        f(&popped)
    }

    /// Inclusive WAL offset below which no unacknowledged request exists;
    /// `None` before the first acknowledgement. Non-decreasing.
    #[must_use]
    pub fn wal_confirm_offset(&self) -> Option<u64> {
        let mut min: Option<u64> = None;
        let mut saw_queue = false;
        for stripe in &self.stripes {
            let stripe = stripe.lock();
            for queue in stripe.values() {
                saw_queue = true;
                match queue.confirm_bound() {
                    // A stream whose head is offset 0 confirms nothing.
                    None if !queue.pending.is_empty() => return None,
                    None => {}
                    Some(bound) => {
                        min = Some(min.map_or(bound, |m| m.min(bound)));
                    }
                }
            }
        }
        if saw_queue && min.is_some() {
            min
        } else if saw_queue {
            None
        } else {
            self.global.lock().max_popped
        }
    }

    /// Drops the stream's queue when it has no in-flight requests, so an
    /// idle stream stops holding back the confirm offset.
    pub fn try_free(&self, stream_id: u64) {
        let mut stripe = self.stripe(stream_id).lock();
        if stripe
            .get(&stream_id)
            .map_or(false, |q| q.pending.is_empty())
        {
            stripe.remove(&stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use silt_core::record::StreamRecord;
    use tokio::sync::oneshot;

    fn request(stream: u64, base: u64) -> Arc<WriteRequest> {
        let record = StreamRecord::new(stream, base, base, Bytes::from_static(b"x")).unwrap();
        WriteRequest::new(record).0
    }

    /// Registers `request` with a fabricated WAL offset.
    fn submit(sequencer: &CallbackSequencer, request: &Arc<WriteRequest>, offset: u64) {
        sequencer
            .submit(request, || {
                let (_tx, rx) = oneshot::channel();
                Ok(WalAppendHandle { offset, ack: rx })
            })
            .unwrap();
    }

    #[test]
    fn in_order_acks_pop_one_by_one() {
        let sequencer = CallbackSequencer::new(8);
        let a = request(1, 0);
        let b = request(1, 1);
        submit(&sequencer, &a, 10);
        submit(&sequencer, &b, 11);

        let popped = sequencer.after(&a);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].wal_offset(), Some(10));

        let popped = sequencer.after(&b);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].wal_offset(), Some(11));
    }

    #[test]
    fn out_of_order_ack_waits_for_head() {
        let sequencer = CallbackSequencer::new(8);
        let a = request(1, 0);
        let b = request(1, 1);
        let c = request(1, 2);
        submit(&sequencer, &a, 10);
        submit(&sequencer, &b, 11);
        submit(&sequencer, &c, 12);

        // Tail acks first: nothing pops until the head persists.
        assert!(sequencer.after(&c).is_empty());
        assert!(sequencer.after(&b).is_empty());

        let popped = sequencer.after(&a);
        let offsets: Vec<_> = popped.iter().map(|r| r.wal_offset().unwrap()).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
    }

    #[test]
    fn streams_do_not_block_each_other() {
        let sequencer = CallbackSequencer::new(8);
        let a = request(1, 0);
        let b = request(2, 0);
        submit(&sequencer, &a, 10);
        submit(&sequencer, &b, 11);

        assert_eq!(sequencer.after(&b).len(), 1);
        assert_eq!(sequencer.after(&a).len(), 1);
    }

    #[test]
    fn confirm_offset_tracks_minimum_across_streams() {
        let sequencer = CallbackSequencer::new(8);
        assert_eq!(sequencer.wal_confirm_offset(), None);

        let a = request(1, 0);
        let b = request(2, 0);
        submit(&sequencer, &a, 10);
        submit(&sequencer, &b, 11);

        sequencer.after(&a);
        // Stream 2's head (offset 11) is still unacked: bound is 10.
        assert_eq!(sequencer.wal_confirm_offset(), Some(10));

        sequencer.after(&b);
        // Stream 1's idle queue still pins the minimum at its last pop.
        assert_eq!(sequencer.wal_confirm_offset(), Some(10));

        sequencer.try_free(1);
        assert_eq!(sequencer.wal_confirm_offset(), Some(11));
    }

    #[test]
    fn confirm_offset_is_non_decreasing_after_free() {
        let sequencer = CallbackSequencer::new(8);
        let a = request(1, 0);
        submit(&sequencer, &a, 10);
        sequencer.after(&a);
        assert_eq!(sequencer.wal_confirm_offset(), Some(10));

        sequencer.try_free(1);
        // No live queues: the global high-water mark stands in.
        assert_eq!(sequencer.wal_confirm_offset(), Some(10));
    }

    #[test]
    fn try_free_keeps_streams_with_inflight_requests() {
        let sequencer = CallbackSequencer::new(8);
        let a = request(1, 0);
        submit(&sequencer, &a, 10);

        sequencer.try_free(1);
        let popped = sequencer.after(&a);
        assert_eq!(popped.len(), 1);
    }
}
