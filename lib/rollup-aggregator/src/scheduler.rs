use std::{
    sync::atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    time::Duration,
};

const NO_FLUSH_PENDING: u64 = 0;
const IMMEDIATE_BIT: u64 = 1;

/// Identifies a single scheduled flush.
///
/// The lowest bit marks an immediate (weight-driven) flush. The remaining bits are a sequence number, which starts at
/// one, so a token is never equal to `NO_FLUSH_PENDING`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FlushToken(u64);

impl FlushToken {
    fn is_immediate(&self) -> bool {
        self.0 & IMMEDIATE_BIT != 0
    }
}

/// A flush the caller must hand over to the scheduler.
#[derive(Debug)]
pub(crate) struct ScheduledFlush {
    token: FlushToken,
    delay: Duration,
}

impl ScheduledFlush {
    pub fn token(&self) -> FlushToken {
        self.token
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Decides when the store should be flushed.
///
/// At most one flush is outstanding at any time. The outstanding flush is tracked by its token: arranging a flush swaps
/// in a fresh token, and a flush that fires only runs if its token is still the current one. A deferred flush can be
/// superseded by an immediate one when the store grows past its maximum weight, in which case the deferred flush becomes
/// a no-op when it eventually fires.
#[derive(Debug)]
pub(crate) struct FlushPolicy {
    flush_interval: Duration,
    max_weight: usize,
    pending: AtomicU64,
    next_sequence: AtomicU64,
}

impl FlushPolicy {
    pub fn new(flush_interval: Duration, max_weight: usize) -> Self {
        Self {
            flush_interval,
            max_weight,
            pending: AtomicU64::new(NO_FLUSH_PENDING),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn is_over_weight(&self, weight: usize) -> bool {
        weight > self.max_weight
    }

    #[cfg(test)]
    pub fn is_scheduled(&self) -> bool {
        self.pending.load(Acquire) != NO_FLUSH_PENDING
    }

    /// Evaluates the policy for the given store weight.
    ///
    /// Returns the flush to schedule, if one is needed.
    pub fn arrange(&self, weight: usize) -> Option<ScheduledFlush> {
        let immediate = self.is_over_weight(weight);

        let mut current = self.pending.load(Acquire);
        loop {
            if current != NO_FLUSH_PENDING && (!immediate || FlushToken(current).is_immediate()) {
                return None;
            }

            let token = self.next_token(immediate);
            match self.pending.compare_exchange(current, token.0, AcqRel, Acquire) {
                Ok(_) => {
                    let delay = if immediate { Duration::ZERO } else { self.flush_interval };
                    return Some(ScheduledFlush { token, delay });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the given scheduled flush as it fires.
    ///
    /// Returns `true` if the token was still current, clearing it so that the flush may arrange a follow-up. Returns
    /// `false` if the flush was superseded or cancelled, in which case it must not run.
    pub fn claim(&self, token: FlushToken) -> bool {
        self.pending
            .compare_exchange(token.0, NO_FLUSH_PENDING, AcqRel, Acquire)
            .is_ok()
    }

    /// Cancels any outstanding flush.
    pub fn cancel(&self) {
        self.pending.store(NO_FLUSH_PENDING, Release);
    }

    fn next_token(&self, immediate: bool) -> FlushToken {
        let sequence = self.next_sequence.fetch_add(1, AcqRel);
        FlushToken((sequence << 1) | if immediate { IMMEDIATE_BIT } else { 0 })
    }
}

/// Determines which buckets are old enough to be flushed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlushWindow {
    rollup_interval: Duration,
    flush_shift: Duration,
}

impl FlushWindow {
    pub fn new(rollup_interval: Duration, flush_shift: Duration) -> Self {
        Self {
            rollup_interval,
            flush_shift,
        }
    }

    /// Returns `true` if a bucket starting at `bucket_start` (in seconds) can be flushed at `now`.
    ///
    /// A bucket is flushable once its window has ended and the flush shift has passed on top of that. A bucket whose
    /// flush time can't be represented is never flushable.
    pub fn is_flushable(&self, bucket_start: u64, now: Duration) -> bool {
        Duration::from_secs(bucket_start)
            .checked_add(self.rollup_interval)
            .and_then(|end| end.checked_add(self.flush_shift))
            .is_some_and(|flush_at| flush_at <= now)
    }
}
