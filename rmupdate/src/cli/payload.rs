// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rsa::RsaPublicKey;
use tracing::warn;

use crate::{
    cli::{config::Config, progress::ProgressWriter, status, warning},
    crypto,
    format::payload::PayloadReader,
    protobuf::chromeos_update_engine::install_operation::Type,
    util::NumBytes,
};

fn open_payload(path: &Path, cancel_signal: &AtomicBool) -> Result<PayloadReader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open payload for reading: {path:?}"))?;

    PayloadReader::new(file, cancel_signal)
        .with_context(|| format!("Failed to read payload: {path:?}"))
}

fn load_public_key(cli_key: Option<&Path>, config: &Config) -> Result<RsaPublicKey> {
    let path = cli_key
        .or(config.public_key.as_deref())
        .ok_or_else(|| {
            anyhow!("No public key specified (use --public-key or set public-key in the config)")
        })?;

    crypto::read_pem_public_key_file(path)
        .with_context(|| format!("Failed to load public key: {path:?}"))
}

fn verify_payload(reader: &PayloadReader<File>, key: &RsaPublicKey) -> Result<()> {
    status!("Verifying payload signature");

    reader
        .verify(key)
        .context("Failed to verify payload signature")
}

fn extract_image(
    reader: &PayloadReader<File>,
    output: &Path,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let install_info = reader.install_info()?;
    let operations = &reader.manifest().partition_operations;

    let file = File::create(output)
        .map(BufWriter::new)
        .with_context(|| format!("Failed to open for writing: {output:?}"))?;
    let mut writer = ProgressWriter::new(file, install_info.size());

    let written = reader
        .execute(operations, install_info, &mut writer, cancel_signal)
        .with_context(|| format!("Failed to extract image: {output:?}"))?;

    writer.finish();

    Ok(written)
}

pub fn extract_main(cli: &ExtractCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_payload(&cli.input, cancel_signal)?;

    if cli.skip_verify {
        warning!("Skipping payload signature verification");
    } else {
        let key = load_public_key(cli.public_key.as_deref(), config)?;
        verify_payload(&reader, &key)?;
    }

    status!("Extracting image to {:?}", cli.output);

    let written = match extract_image(&reader, &cli.output, cancel_signal) {
        Ok(n) => n,
        Err(e) => {
            match fs::remove_file(&cli.output) {
                Err(remove_err) if remove_err.kind() != io::ErrorKind::NotFound => {
                    warn!("Failed to remove incomplete output: {:?}: {remove_err}", cli.output);
                }
                _ => {}
            }
            return Err(e);
        }
    };

    status!("Successfully extracted {:?}", NumBytes(written));

    Ok(())
}

pub fn verify_main(cli: &VerifyCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let key = load_public_key(cli.public_key.as_deref(), config)?;
    let reader = open_payload(&cli.input, cancel_signal)?;

    verify_payload(&reader, &key)?;

    status!("Payload signature is valid");

    Ok(())
}

pub fn inspect_main(cli: &InspectCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_payload(&cli.input, cancel_signal)?;
    let header = reader.header();
    let manifest = &header.manifest;

    println!("Version: {}", header.version);
    println!("Manifest size: {:?}", NumBytes(header.manifest_size));
    println!("Block size: {}", manifest.block_size());
    println!("Data region: {:?}", NumBytes(manifest.signatures_offset()));
    println!("Signatures: {}", reader.signatures().len());
    println!("Digest: {}", hex::encode(reader.digest()));

    if let Some(info) = &manifest.new_partition_info {
        println!("Image size: {:?}", NumBytes(info.size()));
        println!("Image sha256: {}", hex::encode(info.hash()));
    }

    println!("Operations: {}", manifest.partition_operations.len());

    if cli.operations {
        for (i, op) in manifest.partition_operations.iter().enumerate() {
            let ty = Type::try_from(op.r#type)
                .map(|t| t.as_str_name().to_owned())
                .unwrap_or_else(|_| format!("<unknown {}>", op.r#type));
            let extents = op
                .dst_extents
                .iter()
                .map(|e| format!("{}+{}", e.start_block(), e.num_blocks()))
                .collect::<Vec<_>>()
                .join(", ");

            println!(
                "  #{i}: {ty}, data {:?} @ {}, extents [{extents}]",
                NumBytes(op.data_length()),
                op.data_offset(),
            );
        }
    }

    Ok(())
}

/// Extract the image from a payload.
///
/// The payload signature is verified before any data is written. If extraction
/// fails, the partially written output file is deleted.
#[derive(Debug, Parser)]
pub struct ExtractCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Public key for verifying the payload signature.
    ///
    /// No key is built in. Unless --skip-verify is used, this option or the
    /// `public-key` config value is required.
    #[arg(long, value_name = "FILE", value_parser)]
    pub public_key: Option<PathBuf>,

    /// (Insecure) Do not verify the payload signature.
    #[arg(long, conflicts_with = "public_key")]
    pub skip_verify: bool,
}

/// Verify the signature of a payload.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Public key for verifying the payload signature.
    ///
    /// No key is built in. This option or the `public-key` config value is
    /// required.
    #[arg(long, value_name = "FILE", value_parser)]
    pub public_key: Option<PathBuf>,
}

/// Show the payload header and manifest.
#[derive(Debug, Parser)]
pub struct InspectCli {
    /// Path to input payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Also list every install operation.
    #[arg(long)]
    pub operations: bool,
}
