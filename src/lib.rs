// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Push large repositories in chunks.
//!
//! Pushing thousands of commits in one go can run into limits on the remote
//! side. Bigpush instead pushes outgoing commits in __batches__, shrinking
//! the batch size whenever the remote rejects one, and reports exactly which
//! commit could not be pushed if it runs out of options.
//!
//! The batching logic itself lives in [`chunk`] and knows nothing about Git.
//! The [`remote`] module plugs libgit2 into it.

pub mod chunk;
pub mod config;
pub mod path;
pub mod remote;

pub use chunk::{
    transfer, BatchRemote, ChunkedTransfer, SessionState, TransferError, TransferOutcome,
    TransferSession, DEFAULT_MAX_BATCH_SIZE,
};
pub use config::PushSettings;
pub use remote::GitBatchRemote;
