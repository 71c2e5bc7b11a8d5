//! The shared simulation region: a 32-byte POSIX shared memory object that
//! the simulation driver and every shimmed process map at the same time.
//!
//! The byte layout is a contract between unrelated processes, so it is
//! spelled out in [`SharedRegionLayout`] and checked at compile time rather
//! than left to the compiler.

use std::ffi::CString;
use std::io;
use std::mem::{offset_of, size_of};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use static_assertions::const_assert_eq;

use crate::error::ResourceError;

pub const REGION_SIZE: usize = 32;
pub const LAYOUT_VERSION: u32 = 1;

#[repr(C)]
pub struct SharedRegionLayout {
    simulated_seconds: AtomicU32,
    simulated_micros: AtomicU32,
    controller_pid: AtomicI32,
    worker_pid: AtomicI32,
    global_sync_flag: AtomicU8,
    _reserved: [u8; 11],
    /// Stamped by the first attacher; zero means "not yet stamped".
    layout_version: AtomicU32,
}

const_assert_eq!(size_of::<SharedRegionLayout>(), REGION_SIZE);
const_assert_eq!(offset_of!(SharedRegionLayout, simulated_seconds), 0);
const_assert_eq!(offset_of!(SharedRegionLayout, simulated_micros), 4);
const_assert_eq!(offset_of!(SharedRegionLayout, controller_pid), 8);
const_assert_eq!(offset_of!(SharedRegionLayout, worker_pid), 12);
const_assert_eq!(offset_of!(SharedRegionLayout, global_sync_flag), 16);
const_assert_eq!(offset_of!(SharedRegionLayout, layout_version), 28);

/// A mapping of the shared region into this process.
///
/// Dropping it unmaps the memory; the named object itself is left for the
/// simulation driver to remove.
pub struct SharedRegion {
    name: String,
    layout: NonNull<SharedRegionLayout>,
}

// The mapping only holds atomics, so sharing it between threads is fine.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn shm_open(name: &CString, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, libc::S_IRUSR | libc::S_IWUSR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn resize(fd: &OwnedFd) -> io::Result<()> {
    if unsafe { libc::ftruncate(fd.as_raw_fd(), REGION_SIZE as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn object_size(fd: &OwnedFd) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

impl SharedRegion {
    /// Opens the named object if it exists, else creates it, then maps it.
    ///
    /// Two processes racing through the create path both end up with the
    /// same zero-filled 32-byte object, so no creation lock is taken.
    pub fn attach(name: &str) -> Result<Self, ResourceError> {
        let cname = CString::new(name).map_err(|_| ResourceError::InvalidName(name.to_string()))?;

        let fd = match shm_open(&cname, libc::O_RDWR) {
            Ok(fd) => {
                debug!("attaching to existing shared memory {}", name);
                if let Err(e) = resize(&fd) {
                    // The driver may have sized it already.
                    warn!("cannot resize shared memory {}: {}", name, e);
                }
                let size = object_size(&fd).map_err(|source| ResourceError::Resize {
                    name: name.to_string(),
                    source,
                })?;
                if size < REGION_SIZE {
                    return Err(ResourceError::Resize {
                        name: name.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("object is {} bytes, need {}", size, REGION_SIZE),
                        ),
                    });
                }
                fd
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("creating shared memory {}", name);
                let fd = shm_open(&cname, libc::O_CREAT | libc::O_RDWR).map_err(|source| {
                    ResourceError::Open {
                        name: name.to_string(),
                        source,
                    }
                })?;
                resize(&fd).map_err(|source| ResourceError::Resize {
                    name: name.to_string(),
                    source,
                })?;
                fd
            }
            Err(source) => {
                return Err(ResourceError::Open {
                    name: name.to_string(),
                    source,
                })
            }
        };

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ResourceError::Map {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let layout = NonNull::new(addr as *mut SharedRegionLayout).ok_or_else(|| ResourceError::Map {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
        })?;

        // From here on `Drop` unmaps on every error path.
        let region = SharedRegion {
            name: name.to_string(),
            layout,
        };
        region.stamp_version()?;
        Ok(region)
    }

    fn stamp_version(&self) -> Result<(), ResourceError> {
        match self.layout().layout_version.compare_exchange(
            0,
            LAYOUT_VERSION,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(LAYOUT_VERSION) => Ok(()),
            Err(found) => Err(ResourceError::VersionMismatch {
                name: self.name.clone(),
                found,
                expected: LAYOUT_VERSION,
            }),
        }
    }

    /// Unlinks the named object. Teardown belongs to the simulation driver;
    /// the shim itself never calls this.
    pub fn remove(name: &str) -> io::Result<()> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn layout(&self) -> &SharedRegionLayout {
        // Valid for as long as `self` keeps the mapping.
        unsafe { self.layout.as_ref() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start of the mapping in this process.
    pub fn base_addr(&self) -> *const u8 {
        self.layout.as_ptr() as *const u8
    }

    pub fn simulated_seconds(&self) -> u32 {
        self.layout().simulated_seconds.load(Ordering::Acquire)
    }

    pub fn set_simulated_seconds(&self, seconds: u32) {
        self.layout().simulated_seconds.store(seconds, Ordering::Release)
    }

    pub fn simulated_micros(&self) -> u32 {
        self.layout().simulated_micros.load(Ordering::Relaxed)
    }

    pub fn set_simulated_micros(&self, micros: u32) {
        self.layout().simulated_micros.store(micros, Ordering::Relaxed)
    }

    /// Bumps the sub-second counter by `step` and returns the new value.
    /// Wraps silently at `u32::MAX`.
    pub fn advance_micros(&self, step: u32) -> u32 {
        self.layout()
            .simulated_micros
            .fetch_add(step, Ordering::Relaxed)
            .wrapping_add(step)
    }

    pub fn controller_pid(&self) -> i32 {
        self.layout().controller_pid.load(Ordering::Relaxed)
    }

    pub fn set_controller_pid(&self, pid: i32) {
        self.layout().controller_pid.store(pid, Ordering::Relaxed)
    }

    pub fn worker_pid(&self) -> i32 {
        self.layout().worker_pid.load(Ordering::Relaxed)
    }

    pub fn set_worker_pid(&self, pid: i32) {
        self.layout().worker_pid.store(pid, Ordering::Relaxed)
    }

    pub fn global_sync_flag(&self) -> u8 {
        self.layout().global_sync_flag.load(Ordering::Acquire)
    }

    pub fn set_global_sync_flag(&self, flag: u8) {
        self.layout().global_sync_flag.store(flag, Ordering::Release)
    }

    pub fn layout_version(&self) -> u32 {
        self.layout().layout_version.load(Ordering::Acquire)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.layout.as_ptr() as *mut libc::c_void, REGION_SIZE);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("simulated_seconds", &self.simulated_seconds())
            .field("simulated_micros", &self.simulated_micros())
            .field("controller_pid", &self.controller_pid())
            .field("worker_pid", &self.worker_pid())
            .field("global_sync_flag", &self.global_sync_flag())
            .field("layout_version", &self.layout_version())
            .finish()
    }
}

/// Attaches the region at most once per process. A failed attach leaves the
/// slot empty, so the next caller tries again.
#[derive(Debug)]
pub struct RegionAttacher {
    name: String,
    region: OnceCell<SharedRegion>,
}

impl RegionAttacher {
    pub fn new(name: impl Into<String>) -> Self {
        RegionAttacher {
            name: name.into(),
            region: OnceCell::new(),
        }
    }

    pub fn ensure_attached(&self) -> Result<&SharedRegion, ResourceError> {
        self.region.get_or_try_init(|| SharedRegion::attach(&self.name))
    }

    /// The region if a previous call attached it.
    pub fn get(&self) -> Option<&SharedRegion> {
        self.region.get()
    }
}
