// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Chunked transfer of pending items.
//!
//! Large pushes tend to trip over limits on the remote side, e.g., request
//! size caps, or server-side timeouts. Instead of pushing everything in one
//! go, the items are drained in __batches__ of bounded size. A batch that the
//! remote rejects is retried with a limit ten times smaller, and any accepted
//! batch resets the limit back to the configured maximum.
//!
//! # Batch Size Adaptation
//!
//! With a maximum of 1000, a remote that keeps rejecting sees batches of
//! 1000, 100, 10, and 1 items before the transfer is given up on. Dividing
//! by ten converges in at most `log10(max) + 1` steps without needing to know
//! what the remote's actual limit is.
//!
//! # Ordering
//!
//! Items are always sent in sequence order, and a batch is only ever a
//! prefix of what remains. Later items may depend on earlier ones, so the
//! remote never sees an item before everything in front of it has been
//! accepted in a previous batch, or is part of the same batch.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info, instrument, warn};

/// Default ceiling on the number of items per batch.
pub const DEFAULT_MAX_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(size) => size,
    None => unreachable!(),
};

const SHRINK_DIVISOR: usize = 10;

/// Result of attempting to transfer one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Remote accepted every item of the batch.
    Success,

    /// Remote accepted nothing, and its state is unchanged.
    Failure,
}

/// Capability to transfer a batch of items to some remote target.
///
/// Implementors must uphold atomicity: a [`TransferOutcome::Failure`] means
/// the remote did not keep any item of the batch. It must also be safe to
/// call again with a prefix of a batch that previously failed.
pub trait BatchRemote<T> {
    /// Attempt to transfer `batch`, overriding divergence checks if `force`
    /// is set.
    fn attempt(&mut self, batch: &[T], force: bool) -> TransferOutcome;
}

impl<T, F> BatchRemote<T> for F
where
    F: FnMut(&[T], bool) -> TransferOutcome,
{
    fn attempt(&mut self, batch: &[T], force: bool) -> TransferOutcome {
        self(batch, force)
    }
}

/// Current state of a [`TransferSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Items remain, and batch limit is still positive.
    Draining,

    /// All items were transferred.
    Succeeded,

    /// Batch limit dropped to zero with items remaining.
    Failed,
}

impl SessionState {
    /// Session will not make any more attempts.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Draining)
    }
}

/// Run-state of one chunked transfer.
///
/// Owns the full item sequence. Transferred items are only ever removed
/// from the front, so the remaining items are always a suffix of the
/// original sequence.
#[derive(Debug, Clone)]
pub struct TransferSession<T> {
    items: Vec<T>,
    transferred: usize,
    max_batch_size: NonZeroUsize,
    limit: usize,
    attempts: usize,
    state: SessionState,
}

impl<T> TransferSession<T> {
    /// Construct new session in its initial state.
    ///
    /// An empty item sequence starts out as [`SessionState::Succeeded`].
    pub fn new(items: impl IntoIterator<Item = T>, max_batch_size: NonZeroUsize) -> Self {
        let items: Vec<T> = items.into_iter().collect();
        let state = if items.is_empty() {
            SessionState::Succeeded
        } else {
            SessionState::Draining
        };

        Self {
            items,
            transferred: 0,
            max_batch_size,
            limit: max_batch_size.get(),
            attempts: 0,
            state,
        }
    }

    pub fn remaining(&self) -> &[T] {
        &self.items[self.transferred..]
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Current batch size limit. Zero only once the session has failed.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn max_batch_size(&self) -> NonZeroUsize {
        self.max_batch_size
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next batch to attempt, if session is still draining.
    pub fn next_batch(&self) -> Option<&[T]> {
        match self.state {
            SessionState::Draining => {
                let remaining = self.remaining();
                Some(&remaining[..self.limit.min(remaining.len())])
            }
            _ => None,
        }
    }

    /// Apply outcome of attempting [`TransferSession::next_batch`].
    ///
    /// Does nothing once the session reached a terminal state.
    pub fn record(&mut self, outcome: TransferOutcome) -> SessionState {
        if self.state.is_terminal() {
            return self.state;
        }

        let batch_size = self.limit.min(self.remaining().len());
        self.attempts += 1;
        match outcome {
            TransferOutcome::Success => {
                self.transferred += batch_size;
                self.limit = self.max_batch_size.get();
                debug!("pushed {batch_size} ok");
                if self.remaining().is_empty() {
                    self.state = SessionState::Succeeded;
                }
            }
            TransferOutcome::Failure => {
                self.limit /= SHRINK_DIVISOR;
                warn!("batch of {batch_size} rejected, trying {}", self.limit);
                if self.limit == 0 {
                    self.state = SessionState::Failed;
                }
            }
        }

        self.state
    }

    /// Attempt next batch against `remote`, and record its outcome.
    ///
    /// Batches are always attempted with force set, because the caller has
    /// already checked that the transfer as a whole will not diverge.
    pub fn step<R>(&mut self, remote: &mut R) -> SessionState
    where
        R: BatchRemote<T>,
    {
        let outcome = match self.next_batch() {
            Some(batch) => {
                debug!("start: {} to push", self.remaining().len());
                debug!("pushing: {}", batch.len());
                remote.attempt(batch, true)
            }
            None => return self.state,
        };

        self.record(outcome)
    }
}

impl<T: Clone> TransferSession<T> {
    /// Convert terminal session into its final result.
    ///
    /// # Errors
    ///
    /// - Return [`TransferError::Unpushable`] if session failed.
    /// - Return [`TransferError::Cancelled`] if session is still draining.
    pub fn finish(&self) -> Result<usize, TransferError<T>> {
        match self.state {
            SessionState::Succeeded => Ok(self.transferred),
            SessionState::Failed => Err(TransferError::Unpushable {
                item: self.remaining()[0].clone(),
                transferred: self.transferred,
            }),
            SessionState::Draining => Err(TransferError::Cancelled {
                next: self.remaining()[0].clone(),
                transferred: self.transferred,
            }),
        }
    }
}

/// Chunked transfer controller.
///
/// Drains pending items against a remote in adaptively sized batches. The
/// transfer may be cancelled between batches through a shared flag, see
/// [`ChunkedTransfer::with_cancel`].
#[derive(Debug, Clone)]
pub struct ChunkedTransfer {
    max_batch_size: NonZeroUsize,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl ChunkedTransfer {
    /// Construct new controller with given batch size ceiling.
    pub fn new(max_batch_size: NonZeroUsize) -> Self {
        Self {
            max_batch_size,
            cancel: None,
        }
    }

    /// Stop before the next batch once `cancel` is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn max_batch_size(&self) -> NonZeroUsize {
        self.max_batch_size
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|cancel| cancel.load(Ordering::SeqCst))
    }

    /// Transfer all items to remote.
    ///
    /// Returns number of items transferred, which is always the full item
    /// count on success.
    ///
    /// # Errors
    ///
    /// - Return [`TransferError::Unpushable`] if the batch limit shrank to
    ///   zero. Every item before the reported one is on the remote.
    /// - Return [`TransferError::Cancelled`] if cancellation was requested
    ///   before all items were transferred.
    #[instrument(skip_all, fields(max = self.max_batch_size.get()), level = "debug")]
    pub fn run<T, R>(
        &self,
        items: impl IntoIterator<Item = T>,
        remote: &mut R,
    ) -> Result<usize, TransferError<T>>
    where
        T: Clone,
        R: BatchRemote<T>,
    {
        let mut session = TransferSession::new(items, self.max_batch_size);
        while !session.state().is_terminal() {
            if self.is_cancelled() {
                info!("cancelled with {} left to push", session.remaining().len());
                break;
            }
            session.step(remote);
        }

        debug!("done after {} attempts", session.attempts());
        session.finish()
    }
}

/// Transfer items to remote in batches of at most `max_batch_size`.
///
/// # Errors
///
/// - Return [`TransferError::Unpushable`] if an item could not be
///   transferred at all.
pub fn transfer<T, R>(
    items: impl IntoIterator<Item = T>,
    remote: &mut R,
    max_batch_size: NonZeroUsize,
) -> Result<usize, TransferError<T>>
where
    T: Clone,
    R: BatchRemote<T>,
{
    ChunkedTransfer::new(max_batch_size).run(items, remote)
}

/// Chunked transfer error types.
#[derive(Debug, thiserror::Error)]
pub enum TransferError<T> {
    /// Batch limit shrank to zero, so nothing from this item onward was sent.
    #[error("unable to push {item} ({transferred} pushed before it)")]
    Unpushable { item: T, transferred: usize },

    /// Transfer was cancelled between batches.
    #[error("push cancelled before {next} ({transferred} pushed)")]
    Cancelled { next: T, transferred: usize },
}

impl<T> TransferError<T> {
    /// First item that was not transferred.
    pub fn item(&self) -> &T {
        match self {
            Self::Unpushable { item, .. } => item,
            Self::Cancelled { next, .. } => next,
        }
    }

    /// Number of items that made it to the remote.
    pub fn transferred(&self) -> usize {
        match self {
            Self::Unpushable { transferred, .. } | Self::Cancelled { transferred, .. } => {
                *transferred
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    /// Remote that records every batch, and accepts batches up to some size.
    #[derive(Debug, Default)]
    struct RecordingRemote {
        capacity: Option<usize>,
        accepted: Vec<u32>,
        attempts: Vec<Vec<u32>>,
    }

    impl RecordingRemote {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity: Some(capacity),
                ..Default::default()
            }
        }

        fn sizes(&self) -> Vec<usize> {
            self.attempts.iter().map(Vec::len).collect()
        }
    }

    impl BatchRemote<u32> for RecordingRemote {
        fn attempt(&mut self, batch: &[u32], force: bool) -> TransferOutcome {
            assert!(force);
            self.attempts.push(batch.to_vec());
            match self.capacity {
                Some(capacity) if batch.len() > capacity => TransferOutcome::Failure,
                _ => {
                    self.accepted.extend_from_slice(batch);
                    TransferOutcome::Success
                }
            }
        }
    }

    fn max(size: usize) -> NonZeroUsize {
        NonZeroUsize::new(size).unwrap()
    }

    fn items(count: u32) -> Vec<u32> {
        (0..count).collect()
    }

    #[test_case(2500, 1000, vec![1000, 1000, 500]; "multiple full batches")]
    #[test_case(999, 1000, vec![999]; "fits in one batch")]
    #[test_case(3, 1, vec![1, 1, 1]; "single item batches")]
    #[test]
    fn transfer_every_batch_succeeds(count: u32, max_size: usize, expect: Vec<usize>) {
        let mut remote = RecordingRemote::default();
        let result = transfer(items(count), &mut remote, max(max_size));

        pretty_assertions::assert_eq!(result.unwrap(), count as usize);
        pretty_assertions::assert_eq!(remote.sizes(), expect);
        pretty_assertions::assert_eq!(remote.accepted, items(count));
    }

    #[test]
    fn transfer_empty_input_makes_no_attempts() {
        let mut calls = 0;
        let mut remote = |_: &[u32], _: bool| {
            calls += 1;
            TransferOutcome::Success
        };
        let result = transfer(Vec::<u32>::new(), &mut remote, DEFAULT_MAX_BATCH_SIZE);

        assert_eq!(result.unwrap(), 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn transfer_always_failing_remote() {
        let mut remote = RecordingRemote::with_capacity(0);
        let result = transfer(items(5000), &mut remote, DEFAULT_MAX_BATCH_SIZE);

        let error = result.unwrap_err();
        assert!(matches!(
            error,
            TransferError::Unpushable {
                item: 0,
                transferred: 0
            }
        ));
        assert_eq!(remote.sizes(), vec![1000, 100, 10, 1]);
        assert!(remote.accepted.is_empty());
    }

    #[test]
    fn transfer_max_batch_size_one_fails_immediately() {
        let mut remote = RecordingRemote::with_capacity(0);
        let result = transfer(items(3), &mut remote, max(1));

        assert_eq!(result.unwrap_err().item(), &0);
        assert_eq!(remote.sizes(), vec![1]);
    }

    #[test]
    fn transfer_recovers_after_single_failure() {
        let mut failed = false;
        let mut sizes = Vec::new();
        let mut remote = |batch: &[u32], _: bool| {
            sizes.push(batch.len());
            if failed {
                TransferOutcome::Success
            } else {
                failed = true;
                TransferOutcome::Failure
            }
        };
        let result = transfer(items(1500), &mut remote, DEFAULT_MAX_BATCH_SIZE);

        assert_eq!(result.unwrap(), 1500);
        assert_eq!(sizes, vec![1000, 100, 1000, 400]);
    }

    #[test]
    fn transfer_never_resends_confirmed_items() {
        let mut remote = RecordingRemote::with_capacity(37);
        let result = transfer(items(1234), &mut remote, DEFAULT_MAX_BATCH_SIZE);

        assert_eq!(result.unwrap(), 1234);
        assert_eq!(remote.accepted, items(1234));

        // Every attempt starts right after the last accepted item.
        let mut confirmed = 0;
        for batch in &remote.attempts {
            assert_eq!(batch[0], confirmed);
            assert!(batch.windows(2).all(|pair| pair[1] == pair[0] + 1));
            if batch.len() <= 37 {
                confirmed += batch.len() as u32;
            }
        }
    }

    #[test]
    fn transfer_reports_first_unpushable_item() {
        let mut remote = |batch: &[u32], _: bool| {
            if batch.contains(&42) {
                TransferOutcome::Failure
            } else {
                TransferOutcome::Success
            }
        };
        let result = transfer(items(200), &mut remote, max(100));

        let error = result.unwrap_err();
        assert_eq!(error.item(), &42);
        assert_eq!(error.transferred(), 42);
        assert_eq!(error.to_string(), "unable to push 42 (42 pushed before it)");
    }

    #[test]
    fn session_limit_follows_state_machine() {
        let mut session = TransferSession::new(items(20), max(100));
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.next_batch().map(<[u32]>::len), Some(20));

        assert_eq!(session.record(TransferOutcome::Failure), SessionState::Draining);
        assert_eq!(session.limit(), 10);
        assert_eq!(session.next_batch(), Some(&items(10)[..]));

        assert_eq!(session.record(TransferOutcome::Success), SessionState::Draining);
        assert_eq!(session.limit(), 100);
        assert_eq!(session.transferred(), 10);
        assert_eq!(session.remaining(), &items(20)[10..]);

        assert_eq!(session.record(TransferOutcome::Success), SessionState::Succeeded);
        assert_eq!(session.next_batch(), None);
        assert_eq!(session.attempts(), 3);
        assert_eq!(session.finish().unwrap(), 20);

        // Terminal sessions ignore further outcomes.
        assert_eq!(session.record(TransferOutcome::Failure), SessionState::Succeeded);
        assert_eq!(session.attempts(), 3);
    }

    #[test]
    fn controller_stops_between_batches_when_cancelled() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let mut sizes = Vec::new();
        let mut remote = |batch: &[u32], _: bool| {
            sizes.push(batch.len());
            flag.store(true, Ordering::SeqCst);
            TransferOutcome::Success
        };
        let result = ChunkedTransfer::new(max(10))
            .with_cancel(cancel)
            .run(items(35), &mut remote);

        let error = result.unwrap_err();
        assert!(matches!(
            error,
            TransferError::Cancelled {
                next: 10,
                transferred: 10
            }
        ));
        assert_eq!(sizes, vec![10]);
    }
}
