// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::Cell,
    fs::{self, File},
    io::{self, Cursor, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use bzip2::{Compression, write::BzEncoder};
use pkcs8::DecodePrivateKey;
use prost::Message;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use rmupdate::{
    crypto,
    format::payload::{self, ErrorKind, PAYLOAD_HEADER_SIZE, PayloadReader},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallInfo, InstallOperation, Signatures,
        install_operation::Type, signatures::Signature,
    },
    stream::{FileLen, MutexFile, ReadAt},
};

const BLOCK_SIZE: u32 = 4096;

fn get_key(name: &str) -> RsaPrivateKey {
    let data = match name {
        "payload" => include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/keys/TEST_KEY_DO_NOT_USE_payload.key",
        )),
        "other" => include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/keys/TEST_KEY_DO_NOT_USE_other.key",
        )),
        _ => unreachable!(),
    };

    RsaPrivateKey::from_pkcs8_pem(data).unwrap()
}

fn get_public_key() -> RsaPublicKey {
    crypto::parse_pem_public_key(include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/TEST_KEY_DO_NOT_USE_payload.pub.pem",
    )))
    .unwrap()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic, non-repeating test data.
fn pattern(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

struct TestOp {
    ty: Type,
    /// Data as stored in the payload.
    data: Vec<u8>,
    extents: Vec<(u64, u64)>,
}

impl TestOp {
    fn replace(data: Vec<u8>, extents: &[(u64, u64)]) -> Self {
        Self {
            ty: Type::Replace,
            data,
            extents: extents.to_vec(),
        }
    }

    fn replace_bz(data: &[u8], extents: &[(u64, u64)]) -> Self {
        Self {
            ty: Type::ReplaceBz,
            data: bzip2(data),
            extents: extents.to_vec(),
        }
    }
}

struct TestPayload {
    data: Vec<u8>,
    /// Offset of the data region.
    data_start: usize,
}

/// Assemble a signed payload. `image` is the expected output without padding.
fn build_payload(
    ops: &[TestOp],
    block_size: Option<u32>,
    image: &[u8],
    keys: &[&RsaPrivateKey],
) -> TestPayload {
    let mut blob = Vec::new();
    let mut operations = Vec::new();

    for op in ops {
        operations.push(InstallOperation {
            r#type: op.ty as i32,
            data_offset: Some(blob.len() as u64),
            data_length: Some(op.data.len() as u64),
            dst_extents: op
                .extents
                .iter()
                .map(|&(start_block, num_blocks)| Extent {
                    start_block: Some(start_block),
                    num_blocks: Some(num_blocks),
                })
                .collect(),
            data_sha256_hash: Some(sha256(&op.data)),
            ..Default::default()
        });
        blob.extend_from_slice(&op.data);
    }

    let placeholder = |data: Vec<Vec<u8>>| Signatures {
        signatures: data
            .into_iter()
            .map(|d| Signature {
                version: Some(1),
                data: Some(d),
            })
            .collect(),
    };
    let signatures_size = placeholder(vec![vec![0u8; 256]; keys.len()]).encoded_len();

    let manifest = DeltaArchiveManifest {
        partition_operations: operations,
        block_size,
        signatures_offset: Some(blob.len() as u64),
        signatures_size: Some(signatures_size as u64),
        new_partition_info: Some(InstallInfo {
            size: Some(image.len() as u64),
            hash: Some(sha256(image)),
        }),
        ..Default::default()
    }
    .encode_to_vec();

    let mut data = Vec::new();
    data.extend_from_slice(payload::PAYLOAD_MAGIC);
    data.extend_from_slice(&2u64.to_be_bytes());
    data.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
    data.extend_from_slice(&manifest);
    let data_start = data.len();
    data.extend_from_slice(&blob);

    let digest = sha256(&data);
    let signatures = placeholder(
        keys.iter()
            .map(|k| k.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap())
            .collect(),
    )
    .encode_to_vec();
    assert_eq!(signatures.len(), signatures_size);
    data.extend_from_slice(&signatures);

    TestPayload { data, data_start }
}

fn open(data: Vec<u8>) -> payload::Result<PayloadReader<MutexFile<Cursor<Vec<u8>>>>> {
    PayloadReader::new(MutexFile::new(Cursor::new(data)), &AtomicBool::new(false))
}

fn open_err(data: Vec<u8>) -> payload::Error {
    open(data).err().unwrap()
}

/// Reader that records the end of the furthest read.
struct TrackingReader {
    inner: MutexFile<Cursor<Vec<u8>>>,
    max_end: Cell<u64>,
}

impl TrackingReader {
    fn new(data: Vec<u8>) -> Self {
        Self {
            inner: MutexFile::new(Cursor::new(data)),
            max_end: Cell::new(0),
        }
    }
}

impl FileLen for TrackingReader {
    fn file_len(&self) -> io::Result<u64> {
        self.inner.file_len()
    }
}

impl ReadAt for TrackingReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.read_at(buf, offset)?;
        self.max_end.set(self.max_end.get().max(offset + n as u64));
        Ok(n)
    }
}

/// Run every operation in the manifest. Returns the output written so far even
/// if execution fails.
fn extract<R: ReadAt>(reader: &PayloadReader<R>) -> (Vec<u8>, payload::Result<u64>) {
    let mut output = Vec::new();
    let result = reader.install_info().and_then(|info| {
        reader.execute(
            &reader.manifest().partition_operations,
            info,
            &mut output,
            &AtomicBool::new(false),
        )
    });

    (output, result)
}

#[test]
fn extract_single_replace() {
    let key = get_key("payload");
    let image = pattern(8192, 1);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 2)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    assert_eq!(reader.header().version, 2);
    assert_eq!(reader.header().data_offset(), payload.data_start as u64);
    assert_eq!(reader.signatures().len(), 1);
    reader.verify(&get_public_key()).unwrap();

    let (output, result) = extract(&reader);
    assert_eq!(result.unwrap(), 8192);
    assert_eq!(output, image);
}

#[test]
fn extract_mixed_operations() {
    let key = get_key("payload");
    let image = pattern(4 * 4096, 2);
    let payload = build_payload(
        &[
            TestOp::replace(image[..4096].to_vec(), &[(0, 1)]),
            TestOp::replace_bz(&image[4096..3 * 4096], &[(1, 2)]),
            TestOp::replace_bz(&image[3 * 4096..], &[(3, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    reader.verify(&get_public_key()).unwrap();

    let (output, result) = extract(&reader);
    assert_eq!(result.unwrap(), image.len() as u64);
    assert_eq!(output, image);
}

#[test]
fn extract_multiple_extents() {
    let key = get_key("payload");
    let image = pattern(3 * 4096, 3);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1), (1, 2)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    assert_eq!(result.unwrap(), image.len() as u64);
    assert_eq!(output, image);
}

#[test]
fn extract_final_padding() {
    let key = get_key("payload");
    let image = pattern(5000, 4);
    let payload = build_payload(
        &[TestOp::replace_bz(&image, &[(0, 2)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);

    // The padding is written, but is not part of the image digest.
    assert_eq!(result.unwrap(), 8192);
    assert_eq!(&output[..5000], image.as_slice());
    assert!(output[5000..].iter().all(|b| *b == 0));
    assert_eq!(output.len(), 8192);
}

#[test]
fn extract_default_block_size() {
    let key = get_key("payload");
    let image = pattern(4096, 5);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        None,
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    assert_eq!(reader.manifest().block_size(), 4096);

    let (output, result) = extract(&reader);
    assert_eq!(result.unwrap(), 4096);
    assert_eq!(output, image);
}

#[test]
fn reject_zero_block_size() {
    let key = get_key("payload");
    let image = pattern(4096, 6);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(0),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    assert_matches!(result, Err(payload::Error::ZeroBlockSize));
    assert!(output.is_empty());
}

#[test]
fn reject_bad_magic() {
    let key = get_key("payload");
    let image = pattern(4096, 7);
    let mut payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );
    payload.data[..4].copy_from_slice(b"XXXX");

    let reader = TrackingReader::new(payload.data);
    let err = PayloadReader::new(&reader, &AtomicBool::new(false))
        .err()
        .unwrap();
    assert_matches!(err, payload::Error::UnknownMagic(m) if &m == b"XXXX");
    assert_eq!(err.kind(), ErrorKind::Format);

    // Only the magic was read.
    assert_eq!(reader.max_end.get(), 4);
}

#[test]
fn reject_truncated() {
    let key = get_key("payload");
    let image = pattern(4096, 8);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    // Header only.
    let err = open_err(payload.data[..PAYLOAD_HEADER_SIZE].to_vec());
    assert_matches!(err, payload::Error::Truncated("manifest", _, _));
    assert_eq!(err.kind(), ErrorKind::Format);

    // Missing the end of the signatures blob.
    let mut data = payload.data;
    data.pop();
    let err = open_err(data);
    assert_matches!(err, payload::Error::Truncated("signatures", _, _));

    // Too short to even contain the magic.
    let err = open_err(b"Cr".to_vec());
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn reject_huge_manifest_size() {
    let mut data = Vec::new();
    data.extend_from_slice(payload::PAYLOAD_MAGIC);
    data.extend_from_slice(&2u64.to_be_bytes());
    data.extend_from_slice(&u64::MAX.to_be_bytes());

    let err = open_err(data);
    assert_matches!(err, payload::Error::IntegerTooLarge("manifest"));
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn reject_corrupted_data() {
    let key = get_key("payload");
    let image = pattern(2 * 4096, 9);
    let mut payload = build_payload(
        &[
            TestOp::replace(image[..4096].to_vec(), &[(0, 1)]),
            TestOp::replace(image[4096..].to_vec(), &[(1, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );
    payload.data[payload.data_start + 4096 + 10] ^= 0xff;

    let reader = open(payload.data).unwrap();

    // The digest covers the data region.
    let err = reader.verify(&get_public_key()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Signature);

    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(err, payload::Error::MismatchedDataDigest { index: 1, .. });
    assert_eq!(err.kind(), ErrorKind::HashMismatch);
    // Nothing from the corrupted operation is written.
    assert_eq!(output, &image[..4096]);
}

#[test]
fn reject_corrupted_middle_operation() {
    let key = get_key("payload");
    let image = pattern(3 * 4096, 20);
    let mut payload = build_payload(
        &[
            TestOp::replace(image[..4096].to_vec(), &[(0, 1)]),
            TestOp::replace(image[4096..8192].to_vec(), &[(1, 1)]),
            TestOp::replace(image[8192..].to_vec(), &[(2, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );
    payload.data[payload.data_start + 4096 + 10] ^= 0xff;

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(err, payload::Error::MismatchedDataDigest { index: 1, .. });
    assert_eq!(err.kind(), ErrorKind::HashMismatch);

    // Execution stops at the corrupted operation. The last one never runs.
    assert_eq!(output, &image[..4096]);
}

#[test]
fn reject_output_mismatch() {
    let key = get_key("payload");
    let image = pattern(4096, 10);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        b"something else",
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (_, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(err, payload::Error::MismatchedOutputDigest { .. });
    assert_eq!(err.kind(), ErrorKind::HashMismatch);
}

#[test]
fn reject_non_contiguous() {
    let key = get_key("payload");
    let image = pattern(2 * 4096, 11);
    let payload = build_payload(
        &[
            TestOp::replace(image[..4096].to_vec(), &[(0, 1)]),
            TestOp::replace(image[4096..].to_vec(), &[(2, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(
        err,
        payload::Error::NonContiguousExtent {
            index: 1,
            extent: 0,
            expected: 1,
            actual: 2,
        }
    );
    assert_eq!(err.kind(), ErrorKind::Contiguity);
    assert_eq!(output, &image[..4096]);
}

#[test]
fn reject_non_contiguous_over_capacity() {
    let key = get_key("payload");
    let image = pattern(4096 + 5000, 21);
    let payload = build_payload(
        &[
            TestOp::replace(image[..4096].to_vec(), &[(0, 1)]),
            TestOp::replace(image[4096..].to_vec(), &[(2, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();

    // The extent start is checked before the data size.
    assert_matches!(
        err,
        payload::Error::NonContiguousExtent {
            index: 1,
            extent: 0,
            expected: 1,
            actual: 2,
        }
    );
    assert_eq!(err.kind(), ErrorKind::Contiguity);
    assert_eq!(output, &image[..4096]);
}

#[test]
fn reject_padding_before_end() {
    let key = get_key("payload");
    let image = pattern(4096 + 100, 12);
    let payload = build_payload(
        &[
            TestOp::replace(image[..100].to_vec(), &[(0, 1)]),
            TestOp::replace(image[100..].to_vec(), &[(1, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(err, payload::Error::PaddingBeforeEnd { index: 1, .. });
    assert_eq!(err.kind(), ErrorKind::Contiguity);
    assert_eq!(output, &image[..100]);
}

#[test]
fn reject_exceeds_capacity() {
    let key = get_key("payload");
    let image = pattern(4097, 13);
    let payload = build_payload(
        &[TestOp::replace_bz(&image, &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(err, payload::Error::ExceedsCapacity { index: 0, .. });
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(output.is_empty());
}

#[test]
fn reject_unsupported_operation() {
    let key = get_key("payload");
    let image = pattern(4096, 14);
    let mut op = TestOp::replace(image.clone(), &[(0, 1)]);
    op.ty = Type::Move;
    let payload = build_payload(&[op], Some(BLOCK_SIZE), &image, &[&key]);

    let reader = open(payload.data).unwrap();
    let (output, result) = extract(&reader);
    let err = result.unwrap_err();
    assert_matches!(
        err,
        payload::Error::UnsupportedOperation { index: 0, ref ty } if ty == "MOVE"
    );
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    assert!(output.is_empty());
}

#[test]
fn verify_second_candidate() {
    let key = get_key("payload");
    let other = get_key("other");
    let image = pattern(4096, 15);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&other, &key],
    );

    let reader = open(payload.data).unwrap();
    assert_eq!(reader.signatures().len(), 2);
    reader.verify(&get_public_key()).unwrap();
}

#[test]
fn verify_all_candidates_invalid() {
    let other = get_key("other");
    let image = pattern(4096, 16);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&other, &other],
    );

    let reader = open(payload.data).unwrap();
    let err = reader.verify(&get_public_key()).unwrap_err();
    assert_matches!(err, payload::Error::InvalidSignature(2, _));
    assert_eq!(err.kind(), ErrorKind::Signature);
}

#[test]
fn verify_no_candidates() {
    let image = pattern(4096, 17);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[],
    );

    let reader = open(payload.data).unwrap();
    assert!(reader.signatures().is_empty());
    let err = reader.verify(&get_public_key()).unwrap_err();
    assert_matches!(err, payload::Error::NoSignatures);
    assert_eq!(err.kind(), ErrorKind::Signature);
}

#[test]
fn cancel_while_reading() {
    let key = get_key("payload");
    let image = pattern(4096, 18);
    let payload = build_payload(
        &[TestOp::replace(image.clone(), &[(0, 1)])],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let cancel_signal = AtomicBool::new(true);
    let err = PayloadReader::new(MutexFile::new(Cursor::new(payload.data)), &cancel_signal)
        .err()
        .unwrap();
    assert_matches!(&err, payload::Error::Io(e) if e.kind() == io::ErrorKind::Interrupted);
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn extract_file_backed() {
    let key = get_key("payload");
    let image = pattern(3 * 4096 - 123, 19);
    let payload = build_payload(
        &[
            TestOp::replace_bz(&image[..8192], &[(0, 2)]),
            TestOp::replace(image[8192..].to_vec(), &[(2, 1)]),
        ],
        Some(BLOCK_SIZE),
        &image,
        &[&key],
    );

    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("payload.bin");
    let output_path = dir.path().join("image.img");
    fs::write(&input_path, &payload.data).unwrap();

    let reader =
        PayloadReader::new(File::open(&input_path).unwrap(), &AtomicBool::new(false)).unwrap();
    reader.verify(&get_public_key()).unwrap();

    let output = File::create(&output_path).unwrap();
    let written = reader
        .execute(
            &reader.manifest().partition_operations,
            reader.install_info().unwrap(),
            output,
            &AtomicBool::new(false),
        )
        .unwrap();
    assert_eq!(written, 3 * 4096);

    let output = fs::read(&output_path).unwrap();
    assert_eq!(&output[..image.len()], image.as_slice());
    assert_eq!(&output[image.len()..], &[0u8; 123]);
}
