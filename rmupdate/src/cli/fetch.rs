// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use ring::digest::{self, SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use tracing::{info, warn};
use url::Url;

use crate::{
    cli::{config::Config, progress::ProgressWriter, status},
    omaha::{
        client,
        params::{DEFAULT_OMAHA_URL, RequestParams},
    },
    stream,
    util::{self, NumBytes},
};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Event of the manifest action that carries the package's SHA-256 digest.
const POSTINSTALL_EVENT: &str = "postinstall";

/// Use the last path component of the package name as the output filename.
fn default_output_name(package_name: &str) -> Result<PathBuf> {
    match package_name.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(PathBuf::from(name)),
        _ => bail!("Unsafe package name: {package_name:?}"),
    }
}

struct Expected<'a> {
    size: u64,
    sha1: &'a [u8],
    sha256: &'a [u8],
}

fn download(
    url: &Url,
    output: &Path,
    expected: &Expected,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let response = attohttpc::get(url.as_str())
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to start download: {url}"))?;

    let file = File::create(output)
        .map(BufWriter::new)
        .with_context(|| format!("Failed to open for writing: {output:?}"))?;
    let mut writer = ProgressWriter::new(file, expected.size);

    let mut sha1 = digest::Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
    let mut sha256 = digest::Context::new(&SHA256);

    let size = stream::copy_inspect(
        response,
        &mut writer,
        |buf| {
            sha1.update(buf);
            sha256.update(buf);
        },
        cancel_signal,
    )
    .with_context(|| format!("Failed to download {url} to {output:?}"))?;

    writer
        .finish()
        .flush()
        .with_context(|| format!("Failed to flush output: {output:?}"))?;

    if size != expected.size {
        bail!(
            "Expected {:?}, but downloaded {:?}",
            NumBytes(expected.size),
            NumBytes(size),
        );
    }

    util::check_digest(expected.sha1, sha1.finish().as_ref()).map_err(|(e, a)| {
        anyhow!("Expected sha1 {e}, but have {a}")
    })?;
    util::check_digest(expected.sha256, sha256.finish().as_ref()).map_err(|(e, a)| {
        anyhow!("Expected sha256 {e}, but have {a}")
    })?;

    Ok(())
}

pub fn fetch_main(cli: &FetchCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let params = cli.request_params(&config.request);
    if params.platform.is_empty() {
        bail!("No platform specified");
    }

    let omaha_url = cli
        .omaha_url
        .as_deref()
        .or(config.omaha_url.as_deref())
        .unwrap_or(DEFAULT_OMAHA_URL);

    status!("Checking for update: {omaha_url}");

    let request = params.build();
    let response = client::send(omaha_url, &request)?;
    let update = response.app(&params.app_id)?.available_update()?;
    let package = update.single_package()?;
    let action = update.manifest.action(POSTINSTALL_EVENT)?;
    let urls = update.payload_urls(package)?;

    status!(
        "Found version {}: {} ({:?})",
        update.manifest.version,
        package.name,
        NumBytes(package.size),
    );

    let output = match &cli.output {
        Some(p) => p.clone(),
        None => default_output_name(&package.name)?,
    };
    let expected = Expected {
        size: package.size,
        sha1: &package.sha1,
        sha256: &action.sha256,
    };

    // Only the first URL is used. The rest are mirrors of the same file.
    let url = &urls[0];
    info!("Downloading {url} to {output:?}");

    if let Err(e) = download(url, &output, &expected, cancel_signal) {
        match fs::remove_file(&output) {
            Err(remove_err) if remove_err.kind() != io::ErrorKind::NotFound => {
                warn!("Failed to remove incomplete download: {output:?}: {remove_err}");
            }
            _ => {}
        }
        return Err(e);
    }

    status!("Successfully downloaded to {output:?}");

    Ok(())
}

/// Check for an update and download the full payload.
///
/// Values not specified on the command line are taken from the config file,
/// falling back to built-in defaults.
#[derive(Debug, Parser)]
pub struct FetchCli {
    /// Device platform (eg. reMarkable2).
    #[arg(short, long, value_name = "PLATFORM")]
    pub platform: Option<String>,

    /// Path to output payload file.
    ///
    /// Defaults to the package name in the current directory.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,

    /// Update server endpoint.
    #[arg(long, value_name = "URL")]
    pub omaha_url: Option<String>,

    /// App GUID.
    #[arg(long, value_name = "GUID")]
    pub app_id: Option<String>,

    /// Update group (track).
    #[arg(long, value_name = "GROUP")]
    pub group: Option<String>,

    /// Machine architecture.
    #[arg(long, value_name = "ARCH")]
    pub machine: Option<String>,

    /// OS identifier.
    #[arg(long, value_name = "ID")]
    pub os_id: Option<String>,

    /// Currently installed OS version.
    #[arg(long, value_name = "VERSION")]
    pub os_version: Option<String>,

    /// Currently installed release version.
    #[arg(long, value_name = "VERSION")]
    pub release_version: Option<String>,

    /// Device serial number.
    #[arg(long, value_name = "SERIAL")]
    pub serial_number: Option<String>,
}

impl FetchCli {
    fn request_params(&self, base: &RequestParams) -> RequestParams {
        let pick = |value: &Option<String>, fallback: &String| {
            value.clone().unwrap_or_else(|| fallback.clone())
        };

        RequestParams {
            app_id: pick(&self.app_id, &base.app_id),
            group: pick(&self.group, &base.group),
            machine_type: pick(&self.machine, &base.machine_type),
            os_identifier: pick(&self.os_id, &base.os_identifier),
            os_version: pick(&self.os_version, &base.os_version),
            platform: pick(&self.platform, &base.platform),
            release_version: pick(&self.release_version, &base.release_version),
            serial_number: pick(&self.serial_number, &base.serial_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name() {
        assert_eq!(
            default_output_name("2.6.1.71_reMarkable2.signed").unwrap(),
            Path::new("2.6.1.71_reMarkable2.signed"),
        );
        assert_eq!(
            default_output_name("builds/update.signed").unwrap(),
            Path::new("update.signed"),
        );
        default_output_name("").unwrap_err();
        default_output_name("builds/").unwrap_err();
        default_output_name("..").unwrap_err();
    }

    #[test]
    fn params_precedence() {
        let cli = FetchCli::try_parse_from([
            "fetch",
            "-p",
            "reMarkable2",
            "--group",
            "Beta",
        ])
        .unwrap();
        let base = RequestParams {
            group: "Dev".to_owned(),
            serial_number: "RM110-123-45678".to_owned(),
            ..Default::default()
        };

        let params = cli.request_params(&base);
        assert_eq!(params.platform, "reMarkable2");
        assert_eq!(params.group, "Beta");
        assert_eq!(params.serial_number, "RM110-123-45678");
        assert_eq!(params.os_version, RequestParams::default().os_version);
    }
}
