// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::omaha::{
    Error, Result,
    types::{Action, AppResponse, Manifest, Package, Request, Response, UpdateCheckResponse},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Serialize a request into its XML document form.
pub fn serialize_request(request: &Request) -> Result<String> {
    let body = quick_xml::se::to_string(request).map_err(Error::Serialize)?;

    Ok(format!(r#"<?xml version="1.0" encoding="UTF-8"?>{body}"#))
}

/// Parse an XML response document. Unknown elements and attributes are
/// ignored.
pub fn parse_response(data: &str) -> Result<Response> {
    quick_xml::de::from_str(data).map_err(Error::Deserialize)
}

/// POST `request` to the update server at `url` and parse its response.
pub fn send(url: &str, request: &Request) -> Result<Response> {
    let body = serialize_request(request)?;
    debug!("Update request: {body}");

    let text = attohttpc::post(url)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .header("Content-Type", "text/xml")
        .bytes(body.into_bytes())
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| Error::Http(url.to_owned(), e))?;
    debug!("Update response: {text}");

    parse_response(&text)
}

impl Response {
    /// Find the response for the app with the given ID. IDs are GUIDs, so they
    /// are compared case-insensitively.
    pub fn app(&self, id: &str) -> Result<&AppResponse> {
        self.apps
            .iter()
            .find(|a| a.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| Error::MissingApp(id.to_owned()))
    }
}

impl AppResponse {
    /// Return the update check result if an update is available.
    pub fn available_update(&self) -> Result<&UpdateCheckResponse> {
        if self.update_check.status != "ok" {
            return Err(Error::NoUpdate(self.update_check.status.clone()));
        }

        Ok(&self.update_check)
    }
}

impl UpdateCheckResponse {
    /// Return the only package in the manifest. Responses offering multiple
    /// packages are not supported.
    pub fn single_package(&self) -> Result<&Package> {
        match self.manifest.packages.packages.as_slice() {
            [package] => Ok(package),
            packages => Err(Error::UnsupportedPackageCount(packages.len())),
        }
    }

    /// Resolve the download URLs for `package` against every code base in the
    /// response, in order.
    pub fn payload_urls(&self, package: &Package) -> Result<Vec<Url>> {
        if self.urls.urls.is_empty() {
            return Err(Error::NoUrls);
        }

        self.urls
            .urls
            .iter()
            .map(|u| {
                Url::parse(&u.code_base)
                    .and_then(|base| base.join(&package.name))
                    .map_err(|e| Error::InvalidUrl(u.code_base.clone(), e))
            })
            .collect()
    }
}

impl Manifest {
    pub fn action(&self, event: &str) -> Result<&Action> {
        self.actions
            .actions
            .iter()
            .find(|a| a.event == event)
            .ok_or_else(|| Error::MissingAction(event.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::omaha::params::{self, RequestParams};

    const RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<response protocol="3.0" server="nebraska">
  <daystart elapsed_seconds="0"></daystart>
  <app appid="{98da7df2-4e3e-4744-9de6-ec931886abab}" status="ok">
    <ping status="ok"></ping>
    <updatecheck status="ok">
      <urls>
        <url codebase="https://updates.example.com/build-2.6/"></url>
        <url codebase="https://mirror.example.com/build-2.6"></url>
      </urls>
      <manifest version="2.6.1.71">
        <actions>
          <action event="update" ChromeOSVersion="2.6.1.71"></action>
          <action event="postinstall" sha256="LCa0a2j/xo/5m0U8HTBBNBNCLXBkg7+g+YpeiGJm564=" DisablePayloadBackoff="true"></action>
        </actions>
        <packages>
          <package name="2.6.1.71_reMarkable2.signed" hash="C+7Hteo/D9vJXQ3UfzxbwnXaijM=" size="12345" required="true"></package>
        </packages>
      </manifest>
    </updatecheck>
    <event status="ok"></event>
  </app>
</response>
"#;

    #[test]
    fn parse_update_response() {
        let response = parse_response(RESPONSE).unwrap();
        assert_eq!(response.protocol, "3.0");

        let app = response.app(params::DEFAULT_APP_ID).unwrap();
        let update = app.available_update().unwrap();
        assert_eq!(update.manifest.version, "2.6.1.71");

        let package = update.single_package().unwrap();
        assert_eq!(package.name, "2.6.1.71_reMarkable2.signed");
        assert_eq!(package.size, 12345);
        assert_eq!(
            hex::encode(&package.sha1),
            "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33",
        );

        let action = update.manifest.action("postinstall").unwrap();
        assert_eq!(
            hex::encode(&action.sha256),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
        );
        assert_matches!(update.manifest.action("bogus"), Err(Error::MissingAction(_)));

        let urls = update.payload_urls(package).unwrap();
        assert_eq!(
            urls.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
            [
                "https://updates.example.com/build-2.6/2.6.1.71_reMarkable2.signed",
                // Without a trailing slash, the last path component is replaced.
                "https://mirror.example.com/2.6.1.71_reMarkable2.signed",
            ],
        );
    }

    #[test]
    fn parse_no_update() {
        let response = parse_response(
            r#"<response protocol="3.0">
                <app appid="{98DA7DF2-4E3E-4744-9DE6-EC931886ABAB}" status="ok">
                    <updatecheck status="noupdate"></updatecheck>
                </app>
            </response>"#,
        )
        .unwrap();

        let app = response.app(params::DEFAULT_APP_ID).unwrap();
        assert_matches!(app.available_update(), Err(Error::NoUpdate(s)) if s == "noupdate");
        assert_matches!(response.app("{other}"), Err(Error::MissingApp(_)));

        assert_matches!(
            app.update_check.single_package(),
            Err(Error::UnsupportedPackageCount(0))
        );
        assert_matches!(
            app.update_check.payload_urls(&Package::default()),
            Err(Error::NoUrls)
        );
    }

    #[test]
    fn parse_invalid_response() {
        assert_matches!(parse_response("<response"), Err(Error::Deserialize(_)));

        let response = parse_response(
            r#"<response><app appid="x"><updatecheck status="ok"><manifest><packages>
                <package name="a" hash="!!!" size="1"/>
            </packages></manifest></updatecheck></app></response>"#,
        );
        assert_matches!(response, Err(Error::Deserialize(_)));
    }

    #[test]
    fn serialize_update_request() {
        let request = RequestParams::default().build();
        let xml = serialize_request(&request).unwrap();

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><request "#));
        assert!(xml.contains(r#"protocol="3.0""#));
        assert!(xml.contains(r#"installsource="ondemandupdate""#));
        assert!(xml.contains(r#"<os version="codex 2.5.2""#));
        assert!(xml.contains(r#"appid="{98DA7DF2-4E3E-4744-9DE6-EC931886ABAB}""#));
        assert!(xml.contains(r#"track="Prod""#));
        assert!(xml.contains(r#"<ping active="1"/>"#));
        assert!(xml.contains("<updatecheck/>"));
        assert!(xml.contains(r#"<event eventtype="3" eventresult="2" previousversion=""/>"#));
        assert!(xml.ends_with("</request>"));
    }
}
