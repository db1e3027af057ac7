/*
 * SPDX-FileCopyrightText: 2022-2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use bzip2::read::MultiBzDecoder;
use num_traits::ToPrimitive;
use prost::Message;
use ring::digest::{Context, Digest};
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    crypto::{self, RsaPublicKeyExt},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallInfo, InstallOperation, Signatures,
        install_operation::Type, signatures::Signature,
    },
    stream::{
        self, FileLen, HashingWriter, ReadAt, ReadFixedSizeAtExt, SectionReaderAt, UserPosFile,
    },
    util::{self, NumBytes},
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
/// Magic + version + manifest size.
pub const PAYLOAD_HEADER_SIZE: usize = PAYLOAD_MAGIC.len() + 8 + 8;

/// Broad classification of payload errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The container framing or one of its protobuf messages is malformed.
    Format,
    /// Reading the container or writing the output failed.
    Io,
    /// Operation source data or the reconstructed image has the wrong digest.
    HashMismatch,
    /// None of the attached signatures are valid.
    Signature,
    /// The operation type cannot be replayed into a raw image.
    UnsupportedOperation,
    /// Destination extents do not tile the image in order.
    Contiguity,
    /// Decoded data does not fit in the destination extents.
    Capacity,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("{0} ({1:?}) extends beyond the end of the payload ({2:?})")]
    Truncated(&'static str, NumBytes<u64>, NumBytes<u64>),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Block size must not be zero")]
    ZeroBlockSize,
    #[error("Failed to decode {0}")]
    Protobuf(&'static str, #[source] prost::DecodeError),
    #[error("Payload contains no signatures")]
    NoSignatures,
    #[error("No valid signature found among {0} candidates")]
    InvalidSignature(usize, #[source] crypto::Error),
    #[error("Operation #{index}: unsupported type: {ty}")]
    UnsupportedOperation { index: usize, ty: String },
    #[error("Operation #{index}: expected data sha256 {expected}, but have {actual}")]
    MismatchedDataDigest {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("Expected output sha256 {expected}, but have {actual}")]
    MismatchedOutputDigest { expected: String, actual: String },
    #[error("Operation #{index}, extent #{extent}: expected start block {expected}, but have {actual}")]
    NonContiguousExtent {
        index: usize,
        extent: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Operation #{index}, extent #{extent}: padding is only valid at the end of the image")]
    PaddingBeforeEnd { index: usize, extent: usize },
    #[error("Operation #{index}: data ({size:?}) exceeds capacity of destination extents ({capacity:?})")]
    ExceedsCapacity {
        index: usize,
        size: NumBytes<u64>,
        capacity: NumBytes<u64>,
    },
    #[error("Failed to decompress data for operation #{0}")]
    Decompress(usize, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownMagic(_)
            | Self::Truncated(..)
            | Self::MissingField(_)
            | Self::IntegerTooLarge(_)
            | Self::ZeroBlockSize
            | Self::Protobuf(..)
            | Self::Decompress(..) => ErrorKind::Format,
            Self::NoSignatures | Self::InvalidSignature(..) => ErrorKind::Signature,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::MismatchedDataDigest { .. } | Self::MismatchedOutputDigest { .. } => {
                ErrorKind::HashMismatch
            }
            Self::NonContiguousExtent { .. } | Self::PaddingBeforeEnd { .. } => {
                ErrorKind::Contiguity
            }
            Self::ExceedsCapacity { .. } => ErrorKind::Capacity,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct PayloadHeader {
    /// Format version. This is recorded, but not interpreted.
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub manifest_size: u64,
}

impl PayloadHeader {
    /// Offset of the data region, relative to the start of the payload.
    pub fn data_offset(&self) -> u64 {
        PAYLOAD_HEADER_SIZE as u64 + self.manifest_size
    }
}

/// Ensure that `size` bytes starting at `offset` lie within a source of length
/// `len`.
fn check_bounds(name: &'static str, offset: u64, size: u64, len: u64) -> Result<()> {
    let end = offset
        .checked_add(size)
        .ok_or(Error::IntegerTooLarge(name))?;
    if end > len {
        return Err(Error::Truncated(name, NumBytes(end), NumBytes(len)));
    }

    Ok(())
}

/// A parsed payload container. The header, manifest, and signatures are read
/// eagerly. Operation data is read on demand from the data region, which ends
/// where the signatures blob begins.
pub struct PayloadReader<R> {
    header: PayloadHeader,
    signatures: Vec<Signature>,
    data: SectionReaderAt<R>,
    digest: Digest,
}

impl<R: ReadAt> PayloadReader<R> {
    /// Parse the payload header, manifest, and signatures and compute the
    /// digest of everything covered by the signatures. The whole data region is
    /// read once during this call.
    pub fn new(reader: R, cancel_signal: &AtomicBool) -> Result<Self> {
        let file_len = reader.file_len()?;

        let magic = reader.read_array_exact_at::<4>(0)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version_raw = reader.read_array_exact_at::<8>(4)?;
        let manifest_size_raw = reader.read_array_exact_at::<8>(12)?;
        let version = u64::from_be_bytes(version_raw);
        let manifest_size = u64::from_be_bytes(manifest_size_raw);

        check_bounds(
            "manifest",
            PAYLOAD_HEADER_SIZE as u64,
            manifest_size,
            file_len,
        )?;

        let manifest_raw = reader.read_vec_exact_at(
            manifest_size
                .to_usize()
                .ok_or(Error::IntegerTooLarge("manifest_size"))?,
            PAYLOAD_HEADER_SIZE as u64,
        )?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())
            .map_err(|e| Error::Protobuf("manifest", e))?;

        let header = PayloadHeader {
            version,
            manifest,
            manifest_size,
        };
        let data_offset = header.data_offset();

        let signatures_offset = header.manifest.signatures_offset();
        let signatures_size = header.manifest.signatures_size();
        let signatures_start = data_offset
            .checked_add(signatures_offset)
            .ok_or(Error::IntegerTooLarge("signatures_offset"))?;

        check_bounds("signatures", signatures_start, signatures_size, file_len)?;

        let signatures_raw = reader.read_vec_exact_at(
            signatures_size
                .to_usize()
                .ok_or(Error::IntegerTooLarge("signatures_size"))?,
            signatures_start,
        )?;
        let signatures = Signatures::decode(signatures_raw.as_slice())
            .map_err(|e| Error::Protobuf("signatures", e))?;

        // The signatures blob itself is excluded from the data region.
        let data = SectionReaderAt::new(reader, data_offset, signatures_offset)?;

        let mut context = Context::new(&ring::digest::SHA256);
        context.update(PAYLOAD_MAGIC);
        context.update(&version_raw);
        context.update(&manifest_size_raw);
        context.update(&manifest_raw);

        stream::copy_n_inspect(
            UserPosFile::new(&data),
            io::sink(),
            signatures_offset,
            |buf| context.update(buf),
            cancel_signal,
        )?;

        let digest = context.finish();

        debug!(
            "Parsed payload: version={version}, manifest={:?}, data={:?}, signatures={}",
            NumBytes(manifest_size),
            NumBytes(signatures_offset),
            signatures.signatures.len(),
        );

        Ok(Self {
            header,
            signatures: signatures.signatures,
            data,
            digest,
        })
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    pub fn manifest(&self) -> &DeltaArchiveManifest {
        &self.header.manifest
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// SHA-256 digest of the header, manifest, and data region.
    pub fn digest(&self) -> &[u8] {
        self.digest.as_ref()
    }

    /// Installation target for the image described by the manifest.
    pub fn install_info(&self) -> Result<&InstallInfo> {
        self.header
            .manifest
            .new_partition_info
            .as_ref()
            .ok_or(Error::MissingField("new_partition_info"))
    }

    /// Check that at least one of the attached signatures is valid for
    /// [`Self::digest()`]. Candidates are tried in order.
    pub fn verify(&self, key: &RsaPublicKey) -> Result<()> {
        verify_digest(self.digest(), &self.signatures, key)
    }

    /// Read the source data for an operation and check it against the
    /// operation's declared digest.
    pub fn operation_data(&self, index: usize, op: &InstallOperation) -> Result<Vec<u8>> {
        let data_offset = op.data_offset();
        let data_length = op.data_length();

        check_bounds(
            "operation data",
            data_offset,
            data_length,
            self.data.file_len()?,
        )?;

        let data = self.data.read_vec_exact_at(
            data_length
                .to_usize()
                .ok_or(Error::IntegerTooLarge("data_length"))?,
            data_offset,
        )?;

        let digest = ring::digest::digest(&ring::digest::SHA256, &data);
        util::check_digest(op.data_sha256_hash(), digest.as_ref()).map_err(
            |(expected, actual)| Error::MismatchedDataDigest {
                index,
                expected,
                actual,
            },
        )?;

        Ok(data)
    }

    /// Replay `operations` into `writer` and check the result against
    /// `install_info`. Returns the number of bytes written, including any
    /// trailing padding. On error, the contents of `writer` are unspecified.
    pub fn execute(
        &self,
        operations: &[InstallOperation],
        install_info: &InstallInfo,
        writer: impl Write,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let block_size = self.header.manifest.block_size();
        if block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }

        let mut executor = Executor::new(writer, block_size.into());

        for (index, op) in operations.iter().enumerate() {
            stream::check_cancel(cancel_signal)?;

            executor.check_not_finished(index)?;

            let ty = Type::try_from(op.r#type).map_err(|_| Error::UnsupportedOperation {
                index,
                ty: op.r#type.to_string(),
            })?;
            if !matches!(ty, Type::Replace | Type::ReplaceBz) {
                return Err(Error::UnsupportedOperation {
                    index,
                    ty: ty.as_str_name().to_owned(),
                });
            }

            let raw = self.operation_data(index, op)?;
            let data = if ty == Type::ReplaceBz {
                // The exact decoded size is needed for the padding
                // computation, so decompress fully before writing anything.
                let mut buf = Vec::new();
                MultiBzDecoder::new(raw.as_slice())
                    .read_to_end(&mut buf)
                    .map_err(|e| Error::Decompress(index, e))?;
                buf
            } else {
                raw
            };

            debug!(
                "Operation #{index}: {}: {:?} -> {:?}, {} extents",
                ty.as_str_name(),
                NumBytes(op.data_length()),
                NumBytes(data.len() as u64),
                op.dst_extents.len(),
            );

            executor.apply(index, op, &data)?;
        }

        let (written, padding) = executor.finish(install_info.hash())?;

        info!(
            "Wrote {:?} ({:?} of padding)",
            NumBytes(written),
            NumBytes(padding),
        );

        if let Some(size) = install_info.size {
            if size != written {
                warn!(
                    "Output size {:?} does not match expected size {:?}",
                    NumBytes(written),
                    NumBytes(size),
                );
            }
        }

        Ok(written)
    }
}

/// Verify `digest` against each candidate in `signatures` until one succeeds.
fn verify_digest(digest: &[u8], signatures: &[Signature], key: &RsaPublicKey) -> Result<()> {
    let mut last_error = None;

    for (i, signature) in signatures.iter().enumerate() {
        let Some(data) = &signature.data else {
            continue;
        };

        match key.verify_sha256(digest, data) {
            Ok(()) => {
                debug!("Signature #{i} is valid");
                return Ok(());
            }
            Err(e) => {
                debug!("Signature #{i} is invalid: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.map_or(Error::NoSignatures, |e| {
        Error::InvalidSignature(signatures.len(), e)
    }))
}

/// State machine for writing operation data to the output image. Extents must
/// tile the image starting from block 0. Only the very last extent may be
/// partially filled, in which case the remainder is zero-filled, but excluded
/// from the output digest.
struct Executor<W: Write> {
    writer: HashingWriter<W>,
    block_size: u64,
    /// Next expected start block.
    cursor: u64,
    /// Number of bytes of deferred zero fill.
    padding: u64,
    written: u64,
}

impl<W: Write> Executor<W> {
    fn new(writer: W, block_size: u64) -> Self {
        Self {
            writer: HashingWriter::new(writer, Context::new(&ring::digest::SHA256)),
            block_size,
            cursor: 0,
            padding: 0,
            written: 0,
        }
    }

    fn check_not_finished(&self, index: usize) -> Result<()> {
        if self.padding != 0 {
            return Err(Error::PaddingBeforeEnd { index, extent: 0 });
        }

        Ok(())
    }

    /// Write `data` across the destination extents of `op`. Every extent is
    /// checked in order, contiguity first, and the capacity check follows the
    /// last extent. Nothing is written unless all checks pass.
    fn apply(&mut self, index: usize, op: &InstallOperation, data: &[u8]) -> Result<()> {
        let mut cursor = self.cursor;
        let mut padding = self.padding;
        let mut remaining = data.len() as u64;
        let mut chunks = Vec::with_capacity(op.dst_extents.len());

        for (i, extent) in op.dst_extents.iter().enumerate() {
            if padding != 0 {
                return Err(Error::PaddingBeforeEnd { index, extent: i });
            }

            let start_block = extent.start_block();
            if start_block != cursor {
                return Err(Error::NonContiguousExtent {
                    index,
                    extent: i,
                    expected: cursor,
                    actual: start_block,
                });
            }

            let num_blocks = extent.num_blocks();
            cursor = cursor
                .checked_add(num_blocks)
                .ok_or(Error::IntegerTooLarge("num_blocks"))?;

            let extent_size = num_blocks
                .checked_mul(self.block_size)
                .ok_or(Error::IntegerTooLarge("num_blocks"))?;
            let n = extent_size.min(remaining);

            remaining -= n;
            padding = extent_size - n;
            chunks.push(n as usize);
        }

        if remaining != 0 {
            // Every extent was filled completely.
            return Err(Error::ExceedsCapacity {
                index,
                size: NumBytes(data.len() as u64),
                capacity: NumBytes(data.len() as u64 - remaining),
            });
        }

        let mut rest = data;

        for n in chunks {
            let (chunk, tail) = rest.split_at(n);
            self.writer.write_all(chunk)?;
            rest = tail;
        }

        self.written += data.len() as u64;
        self.cursor = cursor;
        self.padding = padding;

        Ok(())
    }

    /// Write the trailing padding and check the output digest. Returns the
    /// total number of bytes written and the amount of padding.
    fn finish(self, expected_digest: &[u8]) -> Result<(u64, u64)> {
        let (mut writer, context) = self.writer.finish();

        // The padding is part of the image, but not part of its digest.
        stream::write_zeros(&mut writer, self.padding)?;
        writer.flush()?;

        let digest = context.finish();
        util::check_digest(expected_digest, digest.as_ref()).map_err(|(expected, actual)| {
            Error::MismatchedOutputDigest { expected, actual }
        })?;

        Ok((self.written + self.padding, self.padding))
    }
}
