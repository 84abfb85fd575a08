// Shared segment creation/attach with header validation, mmap, and the atomic control block.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = *b"AMSG";
const VERSION: u32 = 1;
#[cfg(target_endian = "little")]
const ENDIANNESS_NATIVE: u8 = 1;
#[cfg(target_endian = "big")]
const ENDIANNESS_NATIVE: u8 = 2;

pub const HEADER_SIZE: usize = 64;
pub const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

const STATE_OFFSET: usize = 40;
const MESSAGE_LEN_OFFSET: usize = 48;
const SEQ_OFFSET: usize = 56;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub file_size: u64,
    pub payload_offset: u64,
    pub capacity: u64,
}

impl SegmentHeader {
    fn new(file_size: u64) -> Result<Self, Error> {
        let payload_offset = HEADER_SIZE as u64;
        if file_size <= payload_offset {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("segment size must exceed header size"));
        }
        Ok(Self {
            file_size,
            payload_offset,
            capacity: file_size - payload_offset,
        })
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_NATIVE;

        write_u64(&mut buf, 16, self.file_size);
        write_u64(&mut buf, 24, self.payload_offset);
        write_u64(&mut buf, 32, self.capacity);
        // state word, committed length and sequence start zeroed (Unlocked, empty)
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_NATIVE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("foreign byte order"));
        }

        Ok(Self {
            file_size: read_u64(buf, 16),
            payload_offset: read_u64(buf, 24),
            capacity: read_u64(buf, 32),
        })
    }

    fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.file_size == 0 || self.file_size > actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid file size"));
        }
        if self.payload_offset < HEADER_SIZE as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid payload offset"));
        }
        if self.payload_offset + self.capacity != self.file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload bounds mismatch"));
        }
        if self.capacity == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("capacity is zero"));
        }
        Ok(())
    }

    fn payload_range(&self) -> Range<usize> {
        let start = self.payload_offset as usize;
        start..start + self.capacity as usize
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[derive(Clone, Copy, Debug)]
pub struct SegmentOptions {
    pub file_size: u64,
}

impl SegmentOptions {
    pub fn new(file_size: u64) -> Self {
        Self { file_size }
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SIZE)
    }
}

/// Point-in-time view of the control words, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControlSnapshot {
    pub state: u32,
    pub message_len: u64,
    pub seq: u64,
}

/// The atomic words at the front of the mapping, shared by both processes.
pub struct ControlBlock<'a> {
    base: *mut u8,
    _segment: PhantomData<&'a SharedSegment>,
}

impl<'a> ControlBlock<'a> {
    pub(crate) fn state(&self) -> &AtomicU32 {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long; the
        // state word is 4-byte aligned and is only ever touched atomically.
        unsafe { AtomicU32::from_ptr(self.base.add(STATE_OFFSET).cast()) }
    }

    pub(crate) fn message_len(&self) -> &AtomicU64 {
        // SAFETY: as above, 8-byte aligned word inside the header.
        unsafe { AtomicU64::from_ptr(self.base.add(MESSAGE_LEN_OFFSET).cast()) }
    }

    pub(crate) fn seq(&self) -> &AtomicU64 {
        // SAFETY: as above, 8-byte aligned word inside the header.
        unsafe { AtomicU64::from_ptr(self.base.add(SEQ_OFFSET).cast()) }
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            state: self.state().load(Ordering::Acquire),
            message_len: self.message_len().load(Ordering::Acquire),
            seq: self.seq().load(Ordering::Acquire),
        }
    }
}

pub struct SharedSegment {
    path: PathBuf,
    // Held for the lifetime of the mapping.
    _file: File,
    mmap: MmapMut,
    header: SegmentHeader,
}

impl SharedSegment {
    pub fn create(path: impl AsRef<Path>, options: SegmentOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let header = SegmentHeader::new(options.file_size)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(parent).with_source(err))?;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                let kind = match err.kind() {
                    io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                    _ => ErrorKind::Io,
                };
                Error::new(kind).with_path(&path).with_source(err)
            })?;

        {
            let _guard = HeaderLock::exclusive(&file, &path)?;
            file.set_len(options.file_size)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
            write_header(&file, &header, &path)?;
        }

        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };

        Ok(Self {
            path,
            _file: file,
            mmap,
            header,
        })
    }

    pub fn attach(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| attach_error(&path, err))?;

        let header = {
            let _guard = HeaderLock::shared(&file, &path)?;
            let actual_size = file
                .metadata()
                .map(|meta| meta.len())
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
            let header = read_header(&file, &path)?;
            header.validate(actual_size).map_err(|err| err.with_path(&path))?;
            header
        };

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| attach_error(&path, err))? };

        Ok(Self {
            path,
            _file: file,
            mmap,
            header,
        })
    }

    /// Deletes the backing file; a missing file is not an error.
    pub fn remove(path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(ErrorKind::Io).with_path(path).with_source(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> SegmentHeader {
        self.header
    }

    pub fn capacity(&self) -> usize {
        self.header.capacity as usize
    }

    pub fn control(&self) -> ControlBlock<'_> {
        ControlBlock {
            base: self.mmap.as_ptr() as *mut u8,
            _segment: PhantomData,
        }
    }

    /// Committed bytes of the last message handed over by `write_unlock`.
    pub(crate) fn message(&self) -> &[u8] {
        let len = self.control().message_len().load(Ordering::Acquire) as usize;
        let range = self.header.payload_range();
        let end = range.start + len.min(range.len());
        &self.mmap[range.start..end]
    }

    pub(crate) fn split_mut(&mut self) -> (ControlBlock<'_>, &mut [u8]) {
        let base = self.mmap.as_mut_ptr();
        let range = self.header.payload_range();
        let control = ControlBlock {
            base,
            _segment: PhantomData,
        };
        // The control words live below payload_offset, so the two never overlap.
        (control, &mut self.mmap[range])
    }
}

struct HeaderLock<'a> {
    file: &'a File,
}

impl<'a> HeaderLock<'a> {
    fn exclusive(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }

    fn shared(file: &'a File, path: &Path) -> Result<Self, Error> {
        file.lock_shared().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self { file })
    }
}

impl<'a> Drop for HeaderLock<'a> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file);
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Attach;
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::Attach,
        _ => ErrorKind::Io,
    }
}

fn attach_error(path: &Path, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::new(ErrorKind::Attach)
            .with_message("segment not found")
            .with_hint("The orchestrator creates the segment; start it before attaching.")
            .with_path(path)
            .with_source(err),
        _ if lock_error_kind(&err) == ErrorKind::Attach => Error::new(ErrorKind::Attach)
            .with_message("permission denied mapping segment")
            .with_path(path)
            .with_source(err),
        _ => Error::new(ErrorKind::Io).with_path(path).with_source(err),
    }
}

fn read_header(mut file: &File, path: &Path) -> Result<SegmentHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.read_exact(&mut buf).map_err(|err| {
        let kind = match err.kind() {
            io::ErrorKind::UnexpectedEof => ErrorKind::Corrupt,
            _ => ErrorKind::Io,
        };
        Error::new(kind).with_path(path).with_source(err)
    })?;
    SegmentHeader::decode(&buf)
}

fn write_header(mut file: &File, header: &SegmentHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.write_all(&buf)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.flush()
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    Ok(())
}
