// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git remote handling.
//!
//! Everything the chunked transfer needs to know about an actual Git remote:
//! which commits are outgoing, whether pushing them would diverge the remote
//! branch, and how to push one batch of them.
//!
//! # Outgoing Commits
//!
//! Outgoing commits are walked along __first parents__ only, oldest first.
//! Every prefix of that sequence therefore ends at a commit whose ancestry
//! contains the entire prefix, so pushing the last commit of a batch pushes
//! exactly that batch. Side history of a merge travels together with its
//! merge commit.
//!
//! # Pushing by Commit
//!
//! Each batch is pushed by pointing a local staging reference at the last
//! commit of the batch. Every batch but the final one is pushed to a staging
//! reference of the same name on the remote. The final batch updates the
//! remote branch, after which the remote staging reference is deleted.
//! Forcing the staging reference is harmless, but the remote branch is only
//! ever force updated if the user asked for it. Otherwise an intermediate
//! batch could rewind the remote branch past commits that only the final
//! merge brings back in. The local staging reference is removed once the
//! remote handle is dropped.

use crate::chunk::{BatchRemote, TransferOutcome};

use auth_git2::GitAuthenticator;
use git2::{
    Direction, ErrorCode, Oid, PushOptions, Remote, RemoteCallbacks, Repository, Sort,
};
use indicatif::ProgressBar;
use std::{num::NonZeroUsize, path::Path};
use tracing::{debug, info, instrument, warn};

/// Remote name used when neither caller nor Git configuration picks one.
pub const DEFAULT_REMOTE: &str = "origin";

/// Resolve name of remote to push to.
///
/// Prefers `requested`, then Git's `remote.pushDefault` setting, then
/// [`DEFAULT_REMOTE`].
///
/// # Errors
///
/// - Return [`RemoteError::Git2`] if Git configuration cannot be read.
pub fn resolve_remote_name(repo: &Repository, requested: Option<String>) -> Result<String> {
    if let Some(name) = requested {
        return Ok(name);
    }

    let config = repo.config()?;
    match config.get_string("remote.pushDefault") {
        Ok(name) => Ok(name),
        Err(error) if error.code() == ErrorCode::NotFound => Ok(DEFAULT_REMOTE.into()),
        Err(error) => Err(error.into()),
    }
}

/// Resolve name of local branch to push.
///
/// Prefers `requested`, then the branch HEAD points to, then `fallback`.
///
/// # Errors
///
/// - Return [`RemoteError::DetachedHead`] if no branch could be determined.
pub fn resolve_branch(
    repo: &Repository,
    requested: Option<String>,
    fallback: Option<String>,
) -> Result<String> {
    if let Some(branch) = requested {
        return Ok(branch);
    }

    let head = repo.head().ok().filter(|head| head.is_branch());
    if let Some(name) = head.as_ref().and_then(|head| head.shorthand()) {
        return Ok(name.to_string());
    }

    fallback.ok_or(RemoteError::DetachedHead)
}

/// Determine outgoing commits from `tip` relative to remote.
///
/// Commits reachable from `remote_head`, or from any remote tracking branch
/// of `remote_name`, are considered to already exist on the remote.
///
/// # Errors
///
/// - Return [`RemoteError::Git2`] if revision walk fails.
#[instrument(skip(repo), level = "debug")]
pub fn outgoing(
    repo: &Repository,
    tip: Oid,
    remote_head: Option<Oid>,
    remote_name: Option<&str>,
) -> Result<Vec<Oid>> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    walk.simplify_first_parent()?;
    walk.push(tip)?;

    // INVARIANT: Only hide remote head if we actually have it locally.
    if let Some(head) = remote_head.filter(|head| repo.find_commit(*head).is_ok()) {
        walk.hide(head)?;
    }

    if let Some(name) = remote_name {
        walk.hide_glob(&format!("refs/remotes/{name}/*"))?;
    }

    let commits = walk.collect::<std::result::Result<Vec<_>, _>>()?;
    debug!("{} outgoing commits", commits.len());

    Ok(commits)
}

/// Check if pushing `tip` would leave remote with a head that `tip` does not
/// contain.
///
/// A remote head that is unknown locally always counts as diverging.
///
/// # Errors
///
/// - Return [`RemoteError::Git2`] if ancestry cannot be determined.
pub fn would_diverge(repo: &Repository, tip: Oid, remote_head: Option<Oid>) -> Result<bool> {
    let Some(head) = remote_head else {
        return Ok(false);
    };

    if head == tip {
        return Ok(false);
    }

    if repo.find_commit(head).is_err() {
        warn!("remote head {head} is not known locally");
        return Ok(true);
    }

    Ok(!repo.graph_descendant_of(tip, head)?)
}

/// Check if URL refers to a repository on the local file system.
pub fn is_local_url(url: &str) -> bool {
    url.starts_with("file://") || (!url.contains("://") && Path::new(url).exists())
}

/// How the outgoing commits should be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Push everything in one go.
    Whole,

    /// Push in batches of at most the given size.
    Chunked(NonZeroUsize),
}

/// Decide how to push to remote at `url`.
///
/// Remotes on the local file system are always pushed in one go, since
/// there is no transport limit to work around.
pub fn select_push_mode(chunked: bool, url: &str, max_batch_size: NonZeroUsize) -> PushMode {
    if !chunked {
        return PushMode::Whole;
    }

    if is_local_url(url) {
        info!("{url} is local, pushing in one go");
        return PushMode::Whole;
    }

    PushMode::Chunked(max_batch_size)
}

/// Push target backed by libgit2.
///
/// Implements [`BatchRemote`] over commit ids. Batches before the final one
/// are pushed to a staging reference on the remote, so the remote branch
/// itself only ever moves once, to the final commit, and never rewinds. The
/// `force` flag a batch is attempted with applies to the staging reference
/// only. Whether the remote branch may be force updated is decided through
/// [`GitBatchRemote::set_target`].
pub struct GitBatchRemote<'repo> {
    repo: &'repo Repository,
    remote: Remote<'repo>,
    branch: String,
    bar: ProgressBar,
    target: Option<(Oid, bool)>,
    staged: bool,
}

impl<'repo> GitBatchRemote<'repo> {
    /// Open remote by name, or by URL if no such remote is configured.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Git2`] if remote cannot be found or created.
    pub fn open(
        repo: &'repo Repository,
        remote: &str,
        branch: impl Into<String>,
        bar: ProgressBar,
    ) -> Result<Self> {
        let remote = match repo.find_remote(remote) {
            Ok(remote) => remote,
            Err(error) if error.code() == ErrorCode::NotFound => repo.remote_anonymous(remote)?,
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            repo,
            remote,
            branch: branch.into(),
            bar,
            target: None,
            staged: false,
        })
    }

    /// Set final commit of the push, and whether the remote branch may be
    /// force updated to it.
    ///
    /// Without a target, every batch is treated as final and pushed to the
    /// remote branch as a fast-forward.
    pub fn set_target(&mut self, tip: Oid, force: bool) {
        self.target = Some((tip, force));
    }

    /// Name of remote, unless it was opened by URL.
    pub fn name(&self) -> Option<&str> {
        self.remote.name()
    }

    /// Push URL of remote, falling back to fetch URL.
    pub fn url(&self) -> String {
        self.remote
            .pushurl()
            .or_else(|| self.remote.url())
            .unwrap_or_default()
            .to_string()
    }

    fn remote_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn staging_ref(&self) -> String {
        format!("refs/bigpush/{}", self.branch)
    }

    /// Query current head of target branch on remote.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Git2`] if remote cannot be contacted.
    #[instrument(skip(self), level = "debug")]
    pub fn remote_head(&mut self) -> Result<Option<Oid>> {
        let authenticator = GitAuthenticator::default();
        let config = self.repo.config()?;
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));

        let target = self.remote_ref();
        let connection = self.remote.connect_auth(Direction::Push, Some(rc), None)?;
        let head = connection
            .list()?
            .iter()
            .find(|head| head.name() == target)
            .map(|head| head.oid());
        debug!("remote {target} at {head:?}");

        Ok(head)
    }

    /// Push `oid` and all of its ancestors to the remote branch.
    ///
    /// Removes the remote staging reference afterwards if any batch was
    /// staged before.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Rejected`] if remote refuses the update.
    /// - Return [`RemoteError::Git2`] if push fails in transport.
    #[instrument(skip(self), level = "debug")]
    pub fn push_commit(&mut self, oid: Oid, force: bool) -> Result<()> {
        let staging = self.staging_ref();
        self.repo
            .reference(&staging, oid, true, "bigpush: stage batch")?;

        let refspec = format!(
            "{}{staging}:{}",
            if force { "+" } else { "" },
            self.remote_ref()
        );
        self.push_refspec(&refspec)?;

        // INVARIANT: Keep remote tracking branch in sync with what we pushed.
        if let Some(name) = self.remote.name() {
            let tracking = format!("refs/remotes/{name}/{}", self.branch);
            self.repo
                .reference(&tracking, oid, true, "bigpush: update tracking branch")?;
        }

        if self.staged {
            match self.push_refspec(&format!(":{staging}")) {
                Ok(()) => self.staged = false,
                Err(error) => warn!("could not remove remote {staging}: {error}"),
            }
        }

        Ok(())
    }

    /// Push `oid` and all of its ancestors to the remote staging reference,
    /// leaving the remote branch untouched.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Rejected`] if remote refuses the update.
    /// - Return [`RemoteError::Git2`] if push fails in transport.
    #[instrument(skip(self), level = "debug")]
    pub fn stage_commit(&mut self, oid: Oid, force: bool) -> Result<()> {
        let staging = self.staging_ref();
        self.repo
            .reference(&staging, oid, true, "bigpush: stage batch")?;

        let refspec = format!("{}{staging}:{staging}", if force { "+" } else { "" });
        self.push_refspec(&refspec)?;
        self.staged = true;

        Ok(())
    }

    fn push_refspec(&mut self, refspec: &str) -> Result<()> {
        let authenticator = GitAuthenticator::default();
        let config = self.repo.config()?;
        let bar = self.bar.clone();
        let mut rejection = None;
        {
            let mut rc = RemoteCallbacks::new();
            rc.credentials(authenticator.credentials(&config));
            rc.push_transfer_progress(|current, total, _bytes| {
                bar.set_message(format!("objects {current}/{total}"));
            });
            rc.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    rejection = Some(RemoteError::Rejected {
                        refname: refname.to_string(),
                        reason: status.to_string(),
                    });
                }
                Ok(())
            });

            let mut opts = PushOptions::new();
            opts.remote_callbacks(rc);
            self.remote.push(&[refspec], Some(&mut opts))?;
        }

        match rejection {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl BatchRemote<Oid> for GitBatchRemote<'_> {
    fn attempt(&mut self, batch: &[Oid], force: bool) -> TransferOutcome {
        let Some(last) = batch.last().copied() else {
            return TransferOutcome::Success;
        };

        let result = match self.target {
            Some((tip, _)) if tip != last => self.stage_commit(last, force),
            Some((_, force_branch)) => self.push_commit(last, force_branch),
            None => self.push_commit(last, false),
        };

        match result {
            Ok(()) => {
                self.bar.inc(batch.len() as u64);
                TransferOutcome::Success
            }
            Err(error) => {
                warn!("failed to push {} commits: {error}", batch.len());
                TransferOutcome::Failure
            }
        }
    }
}

impl Drop for GitBatchRemote<'_> {
    fn drop(&mut self) {
        let staging = self.staging_ref();
        if let Ok(mut reference) = self.repo.find_reference(&staging) {
            match reference.delete() {
                Ok(()) => debug!("removed {staging}"),
                Err(error) => info!("could not remove {staging}: {error}"),
            }
        }
    }
}

/// Git remote error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Remote refused to update a reference.
    #[error("remote rejected {refname}: {reason}")]
    Rejected { refname: String, reason: String },

    /// No branch to push could be determined.
    #[error("cannot determine branch to push, HEAD is detached")]
    DetachedHead,

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
