// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::PathBuf;

/// Determine default absolute path to settings file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/bigpush/config.toml` as the
/// default absolute path for the settings file. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory path cannot be
///   determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("bigpush").join("config.toml"))
        .ok_or(NoWayHome)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
