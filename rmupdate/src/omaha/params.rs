// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use serde::Deserialize;
use uuid::Uuid;

use crate::omaha::types::{
    AppRequest, EventRequest, EventResult, EventType, Os, PingRequest, Request,
    UpdateCheckRequest,
};

/// GUID identifying the firmware on the update server.
pub const DEFAULT_APP_ID: &str = "{98DA7DF2-4E3E-4744-9DE6-EC931886ABAB}";
pub const DEFAULT_OMAHA_URL: &str = "https://updates.cloud.remarkable.engineering/service/update2";

const PROTOCOL_VERSION: &str = "3.0";
const UPDATER_VERSION: &str = "0.4.2";
const INSTALL_SOURCE: &str = "ondemandupdate";

/// Device identity and current firmware state reported in update requests.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RequestParams {
    pub app_id: String,
    pub group: String,
    pub machine_type: String,
    pub os_identifier: String,
    pub os_version: String,
    pub platform: String,
    pub release_version: String,
    pub serial_number: String,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_owned(),
            group: "Prod".to_owned(),
            machine_type: "armv7l".to_owned(),
            os_identifier: "codex".to_owned(),
            os_version: "2.5.2".to_owned(),
            platform: String::new(),
            release_version: "2.5.0.0".to_owned(),
            serial_number: "RM100-000-00000".to_owned(),
        }
    }
}

/// Random identifier in the braced form used for request, session, and boot
/// IDs.
fn braced_id() -> String {
    Uuid::new_v4().braced().to_string()
}

/// Random machine ID as 32 lowercase hex digits.
fn machine_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl RequestParams {
    /// Build an update check request. Every call generates fresh random
    /// identifiers.
    pub fn build(&self) -> Request {
        Request {
            protocol: PROTOCOL_VERSION.to_owned(),
            version: self.release_version.clone(),
            request_id: braced_id(),
            session_id: braced_id(),
            updater_version: UPDATER_VERSION.to_owned(),
            install_source: INSTALL_SOURCE.to_owned(),
            is_machine: 1,
            os: Os {
                version: format!("{} {}", self.os_identifier, self.os_version),
                platform: self.platform.clone(),
                service_pack: format!("{}_{}", self.release_version, self.machine_type),
                arch: self.machine_type.clone(),
            },
            apps: vec![AppRequest {
                id: self.app_id.clone(),
                version: self.release_version.clone(),
                track: self.group.clone(),
                additional_parameters: self.group.clone(),
                boot_id: braced_id(),
                oem: self.serial_number.clone(),
                oem_version: self.os_version.clone(),
                aleph_version: self.release_version.clone(),
                machine_id: machine_id(),
                lang: "en-US".to_owned(),
                delta_ok: false,
                ping: PingRequest { active: 1 },
                update_check: UpdateCheckRequest {},
                events: vec![EventRequest {
                    event_type: EventType::UpdateComplete,
                    result: EventResult::SuccessReboot,
                    previous_version: String::new(),
                }],
                ..Default::default()
            }],
        }
    }
}
