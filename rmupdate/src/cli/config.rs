// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::omaha::params::RequestParams;

/// Defaults for command-line options, loaded from the `--config` file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Update server endpoint.
    pub omaha_url: Option<String>,
    /// Public key for verifying payload signatures. Relative paths are
    /// relative to the directory containing the config file.
    pub public_key: Option<PathBuf>,
    /// Device identity reported in update requests.
    pub request: RequestParams,
}

impl Config {
    pub fn parse(data: &str) -> Result<Self> {
        toml_edit::de::from_str(data).context("Failed to parse config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {path:?}"))?;
        let mut config =
            Self::parse(&data).with_context(|| format!("Failed to load config: {path:?}"))?;

        if let (Some(key), Some(parent)) = (&config.public_key, path.parent()) {
            config.public_key = Some(parent.join(key));
        }

        Ok(config)
    }
}
