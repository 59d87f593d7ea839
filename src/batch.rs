//! Coalescing update queue
//!
//! Updates pushed between two ticks are handed to the sink as one batch.
//! Teardown always runs a final flush-and-clear, even when nothing new
//! arrived since the last tick.

use crate::webrtc::WebRTCError;
use log::trace;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Receives coalesced batches
pub type FlushSink<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

pub struct UpdateBatcher<T> {
    pending: Mutex<Vec<T>>,
    /// Serializes flushes so batches reach the sink in push order
    flush_lock: Mutex<()>,
    sink: FlushSink<T>,
    shut_down: AtomicBool,
    flushes: AtomicU64,
}

impl<T> UpdateBatcher<T> {
    pub fn new(sink: FlushSink<T>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            sink,
            shut_down: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
        }
    }

    /// Queue an update for the next flush
    pub fn push(&self, item: T) -> Result<(), WebRTCError> {
        let mut pending = self.pending.lock();
        // Checked under the pending lock so nothing slips in after the final flush
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WebRTCError::SessionClosed);
        }
        pending.push(item);
        Ok(())
    }

    /// Flush whatever accumulated since the previous tick.
    ///
    /// Returns the number of updates flushed; an empty tick does not call the sink.
    pub fn tick(&self) -> usize {
        let _guard = self.flush_lock.lock();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        (self.sink)(batch);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        trace!("Flushed {} coalesced updates", count);
        count
    }

    /// Final flush-and-clear. Only the first call flushes; the sink runs even
    /// if the batch is empty.
    pub fn shutdown(&self) -> usize {
        let _guard = self.flush_lock.lock();
        let batch = {
            let mut pending = self.pending.lock();
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return 0;
            }
            std::mem::take(&mut *pending)
        };
        let count = batch.len();
        (self.sink)(batch);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording_batcher() -> (UpdateBatcher<u32>, Arc<Mutex<Vec<Vec<u32>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let batcher = UpdateBatcher::new(Box::new(move |batch| sink_seen.lock().push(batch)));
        (batcher, seen)
    }

    #[test]
    fn test_updates_within_a_tick_are_coalesced() {
        let (batcher, seen) = recording_batcher();
        batcher.push(1).unwrap();
        batcher.push(2).unwrap();
        batcher.push(3).unwrap();

        assert_eq!(batcher.tick(), 3);
        assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
        assert_eq!(batcher.flush_count(), 1);
    }

    #[test]
    fn test_empty_tick_skips_sink() {
        let (batcher, seen) = recording_batcher();
        assert_eq!(batcher.tick(), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_shutdown_flushes_even_when_idle() {
        let (batcher, seen) = recording_batcher();
        batcher.push(7).unwrap();
        batcher.tick();

        assert_eq!(batcher.shutdown(), 0);
        assert_eq!(*seen.lock(), vec![vec![7], vec![]]);
    }

    #[test]
    fn test_shutdown_drains_pending_once() {
        let (batcher, seen) = recording_batcher();
        batcher.push(1).unwrap();
        batcher.push(2).unwrap();

        assert_eq!(batcher.shutdown(), 2);
        assert_eq!(batcher.shutdown(), 0);
        assert_eq!(seen.lock().len(), 1);
        assert!(matches!(batcher.push(3), Err(WebRTCError::SessionClosed)));
    }
}
