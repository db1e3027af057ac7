// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use ring::digest::Context;

use crate::util;

const BUF_SIZE: usize = 16384;

/// Size of a payload source. The file position is not guaranteed to be
/// preserved.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

impl<F: ?Sized + FileLen> FileLen for &F {
    fn file_len(&self) -> io::Result<u64> {
        (**self).file_len()
    }
}

/// Positional reads from a payload source. Implementations take `&self` so
/// that the data region can be shared by the digest pass and the executor.
pub trait ReadAt: FileLen {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        let size = buf.len();

        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "Expected {size} bytes at offset {}, but reached EOF after {} bytes",
                            offset - (size - buf.len()) as u64,
                            size - buf.len(),
                        ),
                    ));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

impl<R: ?Sized + ReadAt> ReadAt for &R {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// Fixed-size reads for the header fields, the manifest, the signatures blob,
/// and operation data.
pub trait ReadFixedSizeAtExt {
    fn read_array_exact_at<const N: usize>(&self, offset: u64) -> io::Result<[u8; N]>;

    fn read_vec_exact_at(&self, size: usize, offset: u64) -> io::Result<Vec<u8>>;
}

impl<R: ?Sized + ReadAt> ReadFixedSizeAtExt for R {
    fn read_array_exact_at<const N: usize>(&self, offset: u64) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn read_vec_exact_at(&self, size: usize, offset: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }

    /// The kernel's file position is moved on Windows.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }
}

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

/// [`ReadAt`] over an in-memory or seekable source. Reads are serialized and
/// the source position is restored afterwards.
pub struct MutexFile<F>(Mutex<F>);

impl<F> MutexFile<F> {
    pub fn new(file: F) -> Self {
        Self(Mutex::new(file))
    }
}

impl<F: Seek> FileLen for MutexFile<F> {
    fn file_len(&self) -> io::Result<u64> {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let pos = inner.stream_position()?;
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }
}

impl<F: Read + Seek> ReadAt for MutexFile<F> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let pos = inner.stream_position()?;

        inner.seek(SeekFrom::Start(offset))?;
        let result = inner.read(buf);
        inner.seek(SeekFrom::Start(pos))?;

        result
    }
}

/// A window of `size` bytes starting at `start` in the inner source. This is
/// how the data region is exposed, so operation offsets are relative to it and
/// reads never reach into the signatures blob.
pub struct SectionReaderAt<R> {
    inner: R,
    start: u64,
    size: u64,
}

impl<R: ReadAt> SectionReaderAt<R> {
    pub fn new(inner: R, start: u64, size: u64) -> io::Result<Self> {
        if start.checked_add(size).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Section end overflows: {start} + {size}"),
            ));
        }

        Ok(Self { inner, start, size })
    }
}

impl<R> FileLen for SectionReaderAt<R> {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

impl<R: ReadAt> ReadAt for SectionReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(offset).min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        self.inner.read_at(&mut buf[..to_read], self.start + offset)
    }
}

/// Sequential [`Read`] over a [`ReadAt`] source, starting at offset 0.
pub struct UserPosFile<F> {
    file: F,
    offset: u64,
}

impl<F> UserPosFile<F> {
    pub fn new(file: F) -> Self {
        Self { file, offset: 0 }
    }
}

impl<F: ReadAt> Read for UserPosFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Writer that feeds every accepted byte into a digest context.
pub struct HashingWriter<W> {
    inner: W,
    context: Context,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, context: Context) -> Self {
        Self { inner, context }
    }

    pub fn finish(self) -> (W, Context) {
        (self.inner, self.context)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write exactly `size` zero bytes.
pub fn write_zeros(mut writer: impl Write, mut size: u64) -> io::Result<()> {
    while size > 0 {
        let n = size.min(util::ZEROS.len() as u64) as usize;
        writer.write_all(&util::ZEROS[..n])?;
        size -= n as u64;
    }

    Ok(())
}

/// Fails with [`io::ErrorKind::Interrupted`] once `cancel_signal` is set.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes, passing each chunk to `inspect` before it is
/// written. A short reader is an [`io::ErrorKind::UnexpectedEof`] error.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; BUF_SIZE];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let n = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..n])?;
        inspect(&buf[..n]);
        writer.write_all(&buf[..n])?;

        size -= n as u64;
    }

    Ok(())
}

/// Copy until `reader` reaches EOF, passing each chunk to `inspect` before it
/// is written. Returns the number of bytes copied.
pub fn copy_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; BUF_SIZE];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        inspect(&buf[..n]);
        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}
