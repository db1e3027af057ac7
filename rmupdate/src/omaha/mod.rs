// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Minimal client for the Omaha update check protocol.

use thiserror::Error;

pub mod client;
pub mod params;
pub mod types;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to serialize update request")]
    Serialize(#[source] quick_xml::SeError),
    #[error("Failed to parse update response")]
    Deserialize(#[source] quick_xml::DeError),
    #[error("Update request to {0:?} failed")]
    Http(String, #[source] attohttpc::Error),
    #[error("Invalid package URL: {0:?}")]
    InvalidUrl(String, #[source] url::ParseError),
    #[error("Response does not contain app: {0:?}")]
    MissingApp(String),
    #[error("No update available: {0:?}")]
    NoUpdate(String),
    #[error("Expected exactly one package, but have {0}")]
    UnsupportedPackageCount(usize),
    #[error("Response does not contain any package URLs")]
    NoUrls,
    #[error("Manifest does not contain {0:?} action")]
    MissingAction(String),
}

pub type Result<T> = std::result::Result<T, Error>;
