// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Omaha v3 protocol messages. Only the subset used for checking for and
//! fetching full payloads is modeled. Unknown elements and attributes in
//! responses are ignored.

use serde::{Deserialize, Serialize, Serializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    DownloadComplete = 1,
    InstallComplete = 2,
    UpdateComplete = 3,
    UpdateDownloadStarted = 4,
    UpdateDownloadFinished = 5,
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventResult {
    Error = 0,
    Success = 1,
    SuccessReboot = 2,
    UpdateDeferred = 3,
}

impl Serialize for EventResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename = "request")]
pub struct Request {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "@requestid")]
    pub request_id: String,
    #[serde(rename = "@sessionid")]
    pub session_id: String,
    #[serde(rename = "@updaterversion")]
    pub updater_version: String,
    #[serde(rename = "@installsource")]
    pub install_source: String,
    #[serde(rename = "@ismachine")]
    pub is_machine: u8,
    pub os: Os,
    #[serde(rename = "app")]
    pub apps: Vec<AppRequest>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Os {
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "@platform")]
    pub platform: String,
    #[serde(rename = "@sp")]
    pub service_pack: String,
    #[serde(rename = "@arch")]
    pub arch: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AppRequest {
    #[serde(rename = "@appid")]
    pub id: String,
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "@track")]
    pub track: String,
    #[serde(rename = "@ap")]
    pub additional_parameters: String,
    #[serde(rename = "@bootid")]
    pub boot_id: String,
    #[serde(rename = "@oem")]
    pub oem: String,
    #[serde(rename = "@oemversion")]
    pub oem_version: String,
    #[serde(rename = "@alephversion")]
    pub aleph_version: String,
    #[serde(rename = "@machineid")]
    pub machine_id: String,
    #[serde(rename = "@lang")]
    pub lang: String,
    #[serde(rename = "@board")]
    pub board: String,
    #[serde(rename = "@hardware_class")]
    pub hardware_class: String,
    #[serde(rename = "@delta_okay")]
    pub delta_ok: bool,
    #[serde(rename = "@nextversion")]
    pub next_version: String,
    #[serde(rename = "@brand")]
    pub brand: String,
    #[serde(rename = "@client")]
    pub client: String,
    pub ping: PingRequest,
    #[serde(rename = "updatecheck")]
    pub update_check: UpdateCheckRequest,
    #[serde(rename = "event")]
    pub events: Vec<EventRequest>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PingRequest {
    #[serde(rename = "@active")]
    pub active: u8,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UpdateCheckRequest {}

#[derive(Clone, Debug, Serialize)]
pub struct EventRequest {
    #[serde(rename = "@eventtype")]
    pub event_type: EventType,
    #[serde(rename = "@eventresult")]
    pub result: EventResult,
    #[serde(rename = "@previousversion")]
    pub previous_version: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename = "response")]
pub struct Response {
    #[serde(rename = "@protocol", default)]
    pub protocol: String,
    #[serde(rename = "app", default)]
    pub apps: Vec<AppResponse>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppResponse {
    #[serde(rename = "@appid", default)]
    pub id: String,
    #[serde(rename = "@status", default)]
    pub status: String,
    #[serde(rename = "updatecheck", default)]
    pub update_check: UpdateCheckResponse,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateCheckResponse {
    #[serde(rename = "@status", default)]
    pub status: String,
    #[serde(default)]
    pub urls: Urls,
    #[serde(default)]
    pub manifest: Manifest,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Urls {
    #[serde(rename = "url", default)]
    pub urls: Vec<Url>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Url {
    #[serde(rename = "@codebase", default)]
    pub code_base: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub actions: Actions,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Packages {
    #[serde(rename = "package", default)]
    pub packages: Vec<Package>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Package {
    /// SHA-1 digest of the package.
    #[serde(rename = "@hash", default, deserialize_with = "base64_hash::deserialize")]
    pub sha1: Vec<u8>,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@size", default)]
    pub size: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Actions {
    #[serde(rename = "action", default)]
    pub actions: Vec<Action>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Action {
    #[serde(rename = "@event", default)]
    pub event: String,
    /// SHA-256 digest of the package. Usually only present on the
    /// `postinstall` action.
    #[serde(rename = "@sha256", default, deserialize_with = "base64_hash::deserialize")]
    pub sha256: Vec<u8>,
}

/// Hashes are transmitted as standard base64 in attributes.
mod base64_hash {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;

        STANDARD
            .decode(value.trim())
            .map_err(|e| D::Error::custom(format!("invalid base64 hash: {value:?}: {e}")))
    }
}
