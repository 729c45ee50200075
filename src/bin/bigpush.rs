// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use bigpush::{
    chunk::ChunkedTransfer,
    config::PushSettings,
    path::default_config_file,
    remote::{
        outgoing, resolve_branch, resolve_remote_name, select_push_mode, would_diverge,
        GitBatchRemote, PushMode,
    },
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use git2::{BranchType, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    num::NonZeroUsize,
    path::PathBuf,
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Push current repository to a remote, in chunks if asked to.
///
/// Without --chunked, behaves like a plain push of the whole branch. With
/// --chunked, outgoing commits are pushed in batches of at most
/// --max-batch-size commits, shrinking batches whenever the remote rejects
/// one.
#[derive(Debug, Clone, Parser)]
#[command(
    about,
    long_about,
    override_usage = "bigpush [options] [remote]",
    version
)]
struct Cli {
    /// Remote name or URL to push to.
    #[arg(value_name = "remote")]
    pub remote: Option<String>,

    /// Push large repository in chunks.
    #[arg(long)]
    pub chunked: bool,

    /// Local branch to push.
    #[arg(short, long, value_name = "branch")]
    pub branch: Option<String>,

    /// Push only up to this revision.
    #[arg(short, long, value_name = "rev")]
    pub rev: Option<String>,

    /// Push even if remote branch would diverge.
    #[arg(short, long)]
    pub force: bool,

    /// Maximum number of commits per batch.
    #[arg(short = 'n', long, value_name = "count")]
    pub max_batch_size: Option<NonZeroUsize>,

    /// Path to settings file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = match &self.config {
            Some(path) => PushSettings::load(path, true)?,
            None => PushSettings::load(default_config_file()?, false)?,
        };

        let interrupt = Interrupt::default();
        let handler = interrupt.clone();
        tokio::spawn(async move { handler.listen().await });

        tokio::task::spawn_blocking(move || run_push(self, settings, interrupt)).await?
    }
}

/// Ctrl-C handling.
///
/// Only a chunked push can stop cleanly between batches. Outside of it, or
/// on a second Ctrl-C, the process exits right away.
#[derive(Debug, Clone, Default)]
struct Interrupt {
    chunking: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl Interrupt {
    async fn listen(self) {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        if !self.chunking.load(Ordering::SeqCst) {
            exit(130);
        }

        warn!("interrupted, stopping after current batch (Ctrl-C again to abort)");
        self.cancel.store(true, Ordering::SeqCst);
        if tokio::signal::ctrl_c().await.is_ok() {
            exit(130);
        }
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn run_push(opts: Cli, settings: PushSettings, interrupt: Interrupt) -> Result<()> {
    let repo = Repository::open_from_env()?;
    let remote_name = resolve_remote_name(&repo, opts.remote.or(settings.remote))?;
    let branch = resolve_branch(&repo, opts.branch, settings.default_branch)?;
    let tip = match opts.rev {
        Some(rev) => repo.revparse_single(&rev)?.peel_to_commit()?.id(),
        None => repo
            .find_branch(&branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id(),
    };

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<30}  [{wide_bar:.yellow/blue}] {pos}/{len}",
        )?
        .progress_chars("-Cco."),
    );

    let mut remote = GitBatchRemote::open(&repo, &remote_name, &branch, bar.clone())?;
    info!("pushing to {}", remote.url());

    let remote_head = remote.remote_head()?;
    let commits = outgoing(&repo, tip, remote_head, remote.name())?;
    if commits.is_empty() {
        info!("no changes found");
        return Ok(());
    }

    // INVARIANT: Refuse to diverge remote branch unless forced.
    if !opts.force && would_diverge(&repo, tip, remote_head)? {
        bail!("push would diverge remote branch {branch}, merge remote changes or use --force");
    }

    bar.set_length(commits.len() as u64);
    let max_batch_size = opts.max_batch_size.unwrap_or(settings.max_batch_size);
    let max_batch_size = match select_push_mode(opts.chunked, &remote.url(), max_batch_size) {
        PushMode::Whole => {
            debug!("pushing {} commits in one go", commits.len());
            remote.push_commit(tip, opts.force)?;
            bar.finish_and_clear();
            info!("pushed {} commits", commits.len());
            return Ok(());
        }
        PushMode::Chunked(max_batch_size) => max_batch_size,
    };

    // INVARIANT: Remote branch only moves with the final batch.
    remote.set_target(tip, opts.force);
    interrupt.chunking.store(true, Ordering::SeqCst);
    let result = ChunkedTransfer::new(max_batch_size)
        .with_cancel(interrupt.cancel.clone())
        .run(commits, &mut remote);
    interrupt.chunking.store(false, Ordering::SeqCst);
    bar.finish_and_clear();

    let count = result.context("chunked push stopped")?;
    info!("pushed {count} commits");

    Ok(())
}
