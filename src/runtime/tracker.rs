#![allow(clippy::cast_possible_wrap)]

use crate::error::{HeapError, HeapResult};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Wrap-aware "has the counter reached `value`" check.
#[inline]
#[must_use]
pub const fn counter_passed(latest: u32, value: u32) -> bool {
    latest.wrapping_sub(value) as i32 >= 0
}

/// GPU-progress counter. The GPU (or the host device standing in for it)
/// stores the sequence number of the last finished batch here.
#[derive(Debug, Clone, Default)]
pub struct TrackerCounter(Arc<AtomicU32>);

impl TrackerCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn latest(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Stores a completion value. Out of order stores never move it back.
    pub fn store(&self, value: u32) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if counter_passed(current, value) {
                return;
            }
            match self
                .0
                .compare_exchange_weak(current, value, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug)]
struct TrackerSlot {
    counter: TrackerCounter,
    /// Value the next submission on this slot will report on completion.
    next: u32,
    busy: bool,
}

/// Hands out tracker slots to command queues and tracks their sequence
/// numbers.
#[derive(Debug)]
pub struct FrameTrackerProducer {
    slots: Mutex<Vec<TrackerSlot>>,
}

impl FrameTrackerProducer {
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        let slots = (0..slot_count.max(1))
            .map(|_| TrackerSlot {
                counter: TrackerCounter::new(),
                next: 1,
                busy: false,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Reserves a free slot.
    pub fn assign_index(&self) -> HeapResult<u32> {
        let mut slots = self.slots.lock();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.busy)
            .ok_or_else(|| HeapError::InvalidState("all tracker slots in use".into()))?;
        slot.busy = true;
        debug!(index, "tracker slot assigned");
        Ok(index as u32)
    }

    pub fn release_index(&self, index: u32) {
        if let Some(slot) = self.slots.lock().get_mut(index as usize) {
            slot.busy = false;
        }
    }

    pub fn next_tracker(&self, index: u32) -> HeapResult<u32> {
        self.with_slot(index, |s| s.next)
    }

    /// Advances the slot after a submission captured `next_tracker`.
    pub fn step_forward(&self, index: u32) -> HeapResult<()> {
        self.with_slot_mut(index, |s| {
            s.next = s.next.wrapping_add(1);
            if s.next == 0 {
                s.next = 1;
            }
        })
    }

    pub fn counter(&self, index: u32) -> HeapResult<TrackerCounter> {
        self.with_slot(index, |s| s.counter.clone())
    }

    pub fn latest(&self, index: u32) -> HeapResult<u32> {
        self.with_slot(index, |s| s.counter.latest())
    }

    pub fn is_expired(&self, index: u32, value: u32) -> HeapResult<bool> {
        self.with_slot(index, |s| counter_passed(s.counter.latest(), value))
    }

    /// Polls until `value` is reached on `index` or `timeout` elapses.
    pub fn wait_until(
        &self,
        index: u32,
        value: u32,
        timeout: Duration,
        step: Duration,
    ) -> HeapResult<()> {
        let counter = self.counter(index)?;
        let start = Instant::now();
        loop {
            if counter_passed(counter.latest(), value) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                trace!(index, value, "tracker wait timed out");
                return Err(HeapError::WaitTimeout);
            }
            std::thread::sleep(step);
        }
    }

    fn with_slot<T>(&self, index: u32, f: impl FnOnce(&TrackerSlot) -> T) -> HeapResult<T> {
        let slots = self.slots.lock();
        slots
            .get(index as usize)
            .map(f)
            .ok_or_else(|| HeapError::InvalidParameter(format!("tracker index {index}")))
    }

    fn with_slot_mut<T>(
        &self,
        index: u32,
        f: impl FnOnce(&mut TrackerSlot) -> T,
    ) -> HeapResult<T> {
        let mut slots = self.slots.lock();
        slots
            .get_mut(index as usize)
            .map(f)
            .ok_or_else(|| HeapError::InvalidParameter(format!("tracker index {index}")))
    }
}

#[derive(Debug, Clone)]
enum TokenSource {
    Producer(Arc<FrameTrackerProducer>),
    Counter(TrackerCounter),
}

/// Captured `(slot, value)` pairs. Expired once every pair has been passed.
#[derive(Debug, Clone, Default)]
pub struct FrameTrackerToken {
    source: Option<TokenSource>,
    entries: SmallVec<[(u32, u32); 4]>,
}

impl FrameTrackerToken {
    #[must_use]
    pub fn from_producer(producer: Arc<FrameTrackerProducer>, index: u32, value: u32) -> Self {
        let mut entries = SmallVec::new();
        entries.push((index, value));
        Self {
            source: Some(TokenSource::Producer(producer)),
            entries,
        }
    }

    #[must_use]
    pub fn from_counter(counter: TrackerCounter, value: u32) -> Self {
        let mut entries = SmallVec::new();
        entries.push((0, value));
        Self {
            source: Some(TokenSource::Counter(counter)),
            entries,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.source.is_some() && !self.entries.is_empty()
    }

    pub fn invalidate(&mut self) {
        self.source = None;
        self.entries.clear();
    }

    /// Folds `other` into this token, keeping the later value per slot.
    /// Tokens from different sources are not mergeable.
    pub fn merge(&mut self, other: &Self) {
        let Some(other_source) = &other.source else {
            return;
        };
        if self.source.is_none() {
            *self = other.clone();
            return;
        }
        if let Some(src) = &self.source
            && !src.same_source(other_source)
        {
            debug_assert!(false, "merging tokens from different trackers");
            return;
        }
        for &(index, value) in &other.entries {
            match self.entries.iter_mut().find(|(i, _)| *i == index) {
                Some(entry) => {
                    if !counter_passed(entry.1, value) {
                        entry.1 = value;
                    }
                }
                None => self.entries.push((index, value)),
            }
        }
    }

    /// An invalid token has nothing to wait for.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let Some(source) = &self.source else {
            return true;
        };
        self.entries.iter().all(|&(index, value)| match source {
            TokenSource::Producer(p) => p.is_expired(index, value).unwrap_or(true),
            TokenSource::Counter(c) => counter_passed(c.latest(), value),
        })
    }

    #[must_use]
    pub fn entries(&self) -> &[(u32, u32)] {
        &self.entries
    }
}

impl TokenSource {
    fn same_source(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Producer(a), Self::Producer(b)) => Arc::ptr_eq(a, b),
            (Self::Counter(a), Self::Counter(b)) => a.same_as(b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expires_only_after_counter_passes() {
        let producer = Arc::new(FrameTrackerProducer::new(2));
        let idx = producer.assign_index().unwrap();
        let value = producer.next_tracker(idx).unwrap();
        let token = FrameTrackerToken::from_producer(producer.clone(), idx, value);

        assert!(!token.is_expired());
        producer.step_forward(idx).unwrap();
        assert!(!token.is_expired());

        producer.counter(idx).unwrap().store(value);
        assert!(token.is_expired());
    }

    #[test]
    fn counter_never_moves_backwards() {
        let counter = TrackerCounter::new();
        counter.store(5);
        counter.store(3);
        assert_eq!(counter.latest(), 5);
    }

    #[test]
    fn wrap_aware_comparison() {
        assert!(counter_passed(2, u32::MAX));
        assert!(!counter_passed(u32::MAX, 2));
        assert!(counter_passed(7, 7));
    }

    #[test]
    fn merge_keeps_latest_value() {
        let counter = TrackerCounter::new();
        let mut a = FrameTrackerToken::from_counter(counter.clone(), 3);
        let b = FrameTrackerToken::from_counter(counter.clone(), 6);
        a.merge(&b);
        assert_eq!(a.entries(), &[(0, 6)]);
        counter.store(4);
        assert!(!a.is_expired());
        counter.store(6);
        assert!(a.is_expired());
    }

    #[test]
    fn slots_are_exclusive() {
        let producer = FrameTrackerProducer::new(1);
        let idx = producer.assign_index().unwrap();
        assert!(producer.assign_index().is_err());
        producer.release_index(idx);
        assert_eq!(producer.assign_index().unwrap(), idx);
    }

    #[test]
    fn wait_times_out() {
        let producer = FrameTrackerProducer::new(1);
        let res = producer.wait_until(0, 1, Duration::from_millis(5), Duration::from_millis(1));
        assert!(matches!(res, Err(HeapError::WaitTimeout)));
    }

    #[test]
    fn invalid_token_is_expired() {
        let mut token = FrameTrackerToken::from_counter(TrackerCounter::new(), 9);
        assert!(!token.is_expired());
        token.invalidate();
        assert!(!token.is_valid());
        assert!(token.is_expired());
    }
}
