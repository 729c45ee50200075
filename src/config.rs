// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the settings file that bigpush reads its defaults
//! from, and how that file gets loaded.

use crate::chunk::DEFAULT_MAX_BATCH_SIZE;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Push settings layout.
///
/// Every field is optional in the settings file. Missing fields fall back
/// to their defaults, so an empty file is a valid configuration.
///
/// # General Layout
///
/// ```toml
/// max_batch_size = 1000
/// remote = "origin"
/// default_branch = "main"
/// ```
///
/// The remote and default branch values undergo shell expansion, e.g.,
/// `remote = "$HOME/mirror.git"` is a valid remote.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushSettings {
    /// Ceiling on number of commits pushed per batch.
    pub max_batch_size: NonZeroUsize,

    /// Remote to push to when none is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Branch to push when HEAD is detached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            remote: None,
            default_branch: None,
        }
    }
}

impl PushSettings {
    /// Load settings from file at `path`.
    ///
    /// A missing file yields default settings, unless the file is
    /// `required`, e.g., because the user named it explicitly.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadFile`] if file cannot be read, or is
    ///   required but missing.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    /// - Return [`ConfigError::ShellExpansion`] if shell expansion fails.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        match read_to_string(path) {
            Ok(data) => data.parse(),
            Err(error) if error.kind() == ErrorKind::NotFound && !required => {
                debug!("no settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(error) => Err(ConfigError::ReadFile {
                source: error,
                path: path.to_path_buf(),
            }),
        }
    }
}

impl FromStr for PushSettings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: PushSettings = toml::de::from_str(data)?;

        // INVARIANT: Perform shell expansion on string fields.
        settings.remote = settings.remote.map(expand).transpose()?;
        settings.default_branch = settings.default_branch.map(expand).transpose()?;

        Ok(settings)
    }
}

impl Display for PushSettings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(value: String) -> Result<String> {
    Ok(shellexpand::full(value.as_str())?.into_owned())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file cannot be read.
    #[error("failed to read settings file at {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("MIRROR", "/srv/git/mirror.git")])]
    fn deserialize_push_settings() -> anyhow::Result<()> {
        let result: PushSettings = r#"
            max_batch_size = 250
            remote = "$MIRROR"
            default_branch = "trunk"
        "#
        .parse()?;

        let expect = PushSettings {
            max_batch_size: NonZeroUsize::new(250).unwrap(),
            remote: Some("/srv/git/mirror.git".into()),
            default_branch: Some("trunk".into()),
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn deserialize_empty_push_settings() -> anyhow::Result<()> {
        let result: PushSettings = "".parse()?;
        assert_eq!(result, PushSettings::default());
        assert_eq!(result.max_batch_size.get(), 1000);

        Ok(())
    }

    #[test]
    fn deserialize_rejects_zero_batch_size() {
        let result = "max_batch_size = 0".parse::<PushSettings>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[sealed_test]
    fn deserialize_rejects_unset_variable() {
        let result = r#"remote = "$BIGPUSH_NO_SUCH_VAR""#.parse::<PushSettings>();
        assert!(matches!(result, Err(ConfigError::ShellExpansion(_))));
    }

    #[sealed_test]
    fn load_missing_optional_file_uses_defaults() -> anyhow::Result<()> {
        let result = PushSettings::load("missing.toml", false)?;
        assert_eq!(result, PushSettings::default());

        Ok(())
    }

    #[sealed_test]
    fn load_missing_required_file_fails() {
        let result = PushSettings::load("missing.toml", true);
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[sealed_test]
    fn load_existing_file() -> anyhow::Result<()> {
        std::fs::write("config.toml", "max_batch_size = 42\n")?;

        let result = PushSettings::load("config.toml", false)?;
        assert_eq!(result.max_batch_size.get(), 42);

        let result = PushSettings::load("config.toml", true)?;
        assert_eq!(result.max_batch_size.get(), 42);

        Ok(())
    }

    #[test]
    fn serialize_push_settings() {
        let result = PushSettings {
            max_batch_size: NonZeroUsize::new(500).unwrap(),
            remote: Some("origin".into()),
            default_branch: None,
        }
        .to_string();

        let expect = indoc! {r#"
            max_batch_size = 500
            remote = "origin"
        "#};

        assert_eq!(result, expect);
    }
}
