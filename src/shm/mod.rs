//! System V shared memory backing for [`Channel`].
//!
//! Thin wrappers over `ftok`, `shmget`, `shmat`, `shmdt` and `shmctl`. The
//! protocol never sees these; it only talks to a [`Mapping`] through the
//! `Channel` trait.

use crate::channel::Channel;
use crate::protocol::{Flags, FLAGS_OFFSET, PAYLOAD_OFFSET};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Owner read/write.
const SEGMENT_MODE: libc::c_int = 0o600;

pub type Key = libc::key_t;

/// Why an OS call on a segment failed, from `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    AlreadyExists,
    PermissionDenied,
    ResourceLimit,
    NotFound,
    InvalidSize,
    Other,
}

impl Reason {
    fn classify(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EEXIST) => Reason::AlreadyExists,
            Some(libc::EACCES) | Some(libc::EPERM) => Reason::PermissionDenied,
            Some(libc::ENOSPC) | Some(libc::ENOMEM) | Some(libc::EMFILE) => Reason::ResourceLimit,
            Some(libc::ENOENT) | Some(libc::EIDRM) => Reason::NotFound,
            Some(libc::EINVAL) => Reason::InvalidSize,
            _ => Reason::Other,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::AlreadyExists => "already exists",
            Reason::PermissionDenied => "permission denied",
            Reason::ResourceLimit => "system limit reached",
            Reason::NotFound => "no such segment",
            Reason::InvalidSize => "size does not match the existing segment",
            Reason::Other => "os error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("cannot derive channel key from {}", .path.display())]
    Identifier {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create shared memory segment ({reason})")]
    Create {
        reason: Reason,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach shared memory segment ({reason})")]
    Attach {
        reason: Reason,
        #[source]
        source: io::Error,
    },

    #[error("failed to detach shared memory segment")]
    Detach(#[source] io::Error),

    #[error("failed to remove shared memory segment ({reason})")]
    Destroy {
        reason: Reason,
        #[source]
        source: io::Error,
    },
}

impl ShmError {
    fn create(source: io::Error) -> Self {
        ShmError::Create {
            reason: Reason::classify(&source),
            source,
        }
    }

    fn attach(source: io::Error) -> Self {
        ShmError::Attach {
            reason: Reason::classify(&source),
            source,
        }
    }

    fn destroy(source: io::Error) -> Self {
        ShmError::Destroy {
            reason: Reason::classify(&source),
            source,
        }
    }
}

/// Derive the key both peers use to find the segment, from a path that
/// must exist and a small discriminator.
pub fn derive_key(path: &Path, proj_id: u8) -> Result<Key, ShmError> {
    let identifier = |source| ShmError::Identifier {
        path: path.to_path_buf(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| identifier(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    // ftok only looks at the low 8 bits of the id, and 0 is reserved.
    if proj_id == 0 {
        return Err(identifier(io::Error::new(
            io::ErrorKind::InvalidInput,
            "project id must be non-zero",
        )));
    }

    let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(proj_id)) };
    if key == -1 {
        return Err(identifier(io::Error::last_os_error()));
    }
    Ok(key)
}

/// Attributes reported by `IPC_STAT`.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    pub size: usize,
    pub attached: u64,
}

/// Outcome of [`Segment::abandon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    /// A receiver still holds the segment.
    LeftInPlace,
}

/// A segment identifier; dropping it leaves the segment in place.
#[derive(Debug)]
pub struct Segment {
    id: libc::c_int,
    key: Key,
    size: usize,
    created: bool,
}

impl Segment {
    /// Create the segment, or open it if the peer got there first. The
    /// existing segment's size wins; it must be at least `size`.
    pub fn create(key: Key, size: usize) -> Result<Self, ShmError> {
        let id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | SEGMENT_MODE) };
        if id != -1 {
            tracing::debug!(key, id, size, "created shared memory segment");
            return Ok(Self {
                id,
                key,
                size,
                created: true,
            });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ShmError::create(err));
        }

        let id = unsafe { libc::shmget(key, size, SEGMENT_MODE) };
        if id == -1 {
            return Err(ShmError::create(io::Error::last_os_error()));
        }
        let info = stat(id).map_err(ShmError::create)?;
        tracing::debug!(key, id, size = info.size, "opened existing shared memory segment");
        Ok(Self {
            id,
            key,
            size: info.size,
            created: false,
        })
    }

    /// Open a segment that must already exist.
    pub fn open(key: Key) -> Result<Self, ShmError> {
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id == -1 {
            return Err(ShmError::attach(io::Error::last_os_error()));
        }
        let info = stat(id).map_err(ShmError::attach)?;
        Ok(Self {
            id,
            key,
            size: info.size,
            created: false,
        })
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this call brought the segment into existence.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn stat(&self) -> Result<SegmentInfo, ShmError> {
        stat(self.id).map_err(ShmError::attach)
    }

    /// Map the segment into this process.
    pub fn attach(&self) -> Result<Mapping, ShmError> {
        let addr = unsafe { libc::shmat(self.id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::attach(io::Error::last_os_error()));
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ShmError::attach(io::Error::other("shmat returned null")))?;
        tracing::debug!(id = self.id, "attached shared memory segment");
        Ok(Mapping {
            base,
            len: self.size,
            attached: true,
        })
    }

    /// Clear every flag if `mapping` is the only attachment. Bits raised by
    /// a peer that died without detaching cleanly would otherwise be taken
    /// for live ones. Returns the bits that were cleared.
    pub fn reset_if_alone(&self, mapping: &Mapping) -> Result<Flags, ShmError> {
        if self.stat()?.attached > 1 {
            return Ok(Flags::EMPTY);
        }
        let stale = mapping.flags();
        if !stale.is_empty() {
            tracing::warn!(%stale, "clearing flags left by a departed peer");
            mapping.lower(stale);
        }
        Ok(stale)
    }

    /// Tear down after a failed send. The segment is removed only when no
    /// receiver still has `RECEIVER_READY` raised.
    pub fn abandon(self, mapping: Mapping) -> Result<Teardown, ShmError> {
        let receiver_attached = mapping.flags().contains(Flags::RECEIVER_READY);
        mapping.detach()?;
        if receiver_attached {
            return Ok(Teardown::LeftInPlace);
        }
        self.destroy()?;
        Ok(Teardown::Removed)
    }

    /// Mark the segment for removal. The kernel frees it once the last
    /// process detaches.
    pub fn destroy(self) -> Result<(), ShmError> {
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) };
        if rc == -1 {
            return Err(ShmError::destroy(io::Error::last_os_error()));
        }
        tracing::debug!(id = self.id, "removed shared memory segment");
        Ok(())
    }
}

fn stat(id: libc::c_int) -> io::Result<SegmentInfo> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(SegmentInfo {
        size: ds.shm_segsz as usize,
        attached: ds.shm_nattch as u64,
    })
}

/// A segment mapped into this process, usable as a [`Channel`].
///
/// Dropping an attached mapping detaches it, ignoring errors; call
/// [`Mapping::detach`] to see them.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
    attached: bool,
}

impl Mapping {
    pub fn detach(mut self) -> Result<(), ShmError> {
        self.attached = false;
        let rc = unsafe { libc::shmdt(self.base.as_ptr().cast::<libc::c_void>()) };
        if rc == -1 {
            return Err(ShmError::Detach(io::Error::last_os_error()));
        }
        tracing::debug!("detached shared memory segment");
        Ok(())
    }

    fn flags_byte(&self) -> &AtomicU8 {
        // SAFETY: the mapping is at least MIN_REGION_SIZE bytes long and stays
        // mapped for the lifetime of `self`. AtomicU8 has the layout of u8.
        unsafe { &*self.base.as_ptr().add(FLAGS_OFFSET).cast::<AtomicU8>() }
    }

    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: PAYLOAD_OFFSET is inside the mapping.
        unsafe { self.base.as_ptr().add(PAYLOAD_OFFSET) }
    }
}

impl Channel for Mapping {
    fn size(&self) -> usize {
        self.len
    }

    fn flags(&self) -> Flags {
        Flags::from_bits(self.flags_byte().load(Ordering::Acquire))
    }

    fn raise(&self, flags: Flags) {
        self.flags_byte().fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn lower(&self, flags: Flags) {
        self.flags_byte().fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn write_payload(&self, payload: &[u8]) {
        assert!(payload.len() <= self.len - PAYLOAD_OFFSET, "payload overflows segment");
        // SAFETY: bounds checked above. The flags protocol gives this side
        // exclusive ownership of the payload area while it writes.
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), self.payload_ptr(), payload.len()) }
    }

    fn read_payload(&self, buf: &mut [u8]) {
        assert!(buf.len() <= self.len - PAYLOAD_OFFSET, "read overflows segment");
        // SAFETY: bounds checked above. The peer does not write the payload
        // area between publishing a chunk and seeing DATA_READ.
        unsafe { ptr::copy_nonoverlapping(self.payload_ptr(), buf.as_mut_ptr(), buf.len()) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.attached {
            unsafe {
                libc::shmdt(self.base.as_ptr().cast::<libc::c_void>());
            }
        }
    }
}
