//! Finds the genuine libc implementations of the functions the shim stands in
//! for, so the shim can delegate to them without calling itself.

use std::ffi::{c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::{debug, error};

use crate::error::SymbolResolutionError;
use crate::vdso::vDSO;

pub type TimeFn = unsafe extern "C" fn(*mut libc::time_t) -> libc::time_t;
pub type GettimeofdayFn = unsafe extern "C" fn(*mut libc::timeval, *mut c_void) -> libc::c_int;
pub type GetpwnamRFn = unsafe extern "C" fn(
    *const libc::c_char,
    *mut libc::passwd,
    *mut libc::c_char,
    libc::size_t,
    *mut *mut libc::passwd,
) -> libc::c_int;
pub type GetpwuidRFn = unsafe extern "C" fn(
    libc::uid_t,
    *mut libc::passwd,
    *mut libc::c_char,
    libc::size_t,
    *mut *mut libc::passwd,
) -> libc::c_int;

#[cfg(target_arch = "x86_64")]
const VDSO_TIME: Option<&str> = Some("__vdso_time");
#[cfg(target_arch = "x86_64")]
const VDSO_GETTIMEOFDAY: Option<&str> = Some("__vdso_gettimeofday");
#[cfg(target_arch = "aarch64")]
const VDSO_TIME: Option<&str> = None;
#[cfg(target_arch = "aarch64")]
const VDSO_GETTIMEOFDAY: Option<&str> = Some("__kernel_gettimeofday");
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const VDSO_TIME: Option<&str> = None;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const VDSO_GETTIMEOFDAY: Option<&str> = None;

/// A write-once cache for one resolved symbol. Null means "not resolved yet";
/// a failed lookup leaves it null so the next caller retries.
struct SymbolSlot {
    symbol: &'static str,
    c_symbol: &'static CStr,
    vdso_symbol: Option<&'static str>,
    ptr: AtomicPtr<c_void>,
}

impl SymbolSlot {
    const fn new(
        symbol: &'static str,
        c_symbol: &'static CStr,
        vdso_symbol: Option<&'static str>,
    ) -> Self {
        SymbolSlot {
            symbol,
            c_symbol,
            vdso_symbol,
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn is_resolved(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    fn resolve(&self) -> Result<*mut c_void, SymbolResolutionError> {
        let cached = self.ptr.load(Ordering::Acquire);
        if !cached.is_null() {
            return Ok(cached);
        }

        debug!("looking for real {}", self.symbol);
        let found = match next_symbol(self.symbol, self.c_symbol) {
            Ok(found) => found,
            Err(e) => match self.vdso_symbol {
                Some(vdso_name) => {
                    debug!("{}; trying the vDSO", e);
                    vDSO::lookup(self.symbol, vdso_name)? as *mut c_void
                }
                None => return Err(e),
            },
        };

        match self
            .ptr
            .compare_exchange(ptr::null_mut(), found, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(found),
            // Another thread got there first; its pointer wins.
            Err(existing) => Ok(existing),
        }
    }
}

/// `dlsym(RTLD_NEXT, ..)`: the next definition after the calling object, i.e.
/// libc's, even when this library is the one exporting the name.
fn next_symbol(symbol: &'static str, c_symbol: &CStr) -> Result<*mut c_void, SymbolResolutionError> {
    let found = unsafe { libc::dlsym(libc::RTLD_NEXT, c_symbol.as_ptr()) };
    if found.is_null() {
        let reason = unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "symbol not found".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        };
        return Err(SymbolResolutionError { symbol, reason });
    }
    Ok(found)
}

pub struct RealFunctionResolver {
    time: SymbolSlot,
    gettimeofday: SymbolSlot,
    getpwnam_r: SymbolSlot,
    getpwuid_r: SymbolSlot,
}

impl Default for RealFunctionResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl RealFunctionResolver {
    pub const fn new() -> Self {
        RealFunctionResolver {
            time: SymbolSlot::new("time", c"time", VDSO_TIME),
            gettimeofday: SymbolSlot::new("gettimeofday", c"gettimeofday", VDSO_GETTIMEOFDAY),
            getpwnam_r: SymbolSlot::new("getpwnam_r", c"getpwnam_r", None),
            getpwuid_r: SymbolSlot::new("getpwuid_r", c"getpwuid_r", None),
        }
    }

    fn logged(slot: &SymbolSlot) -> Result<*mut c_void, SymbolResolutionError> {
        slot.resolve().inspect_err(|e| error!("{}", e))
    }

    pub fn real_time(&self) -> Result<TimeFn, SymbolResolutionError> {
        Self::logged(&self.time).map(|p| unsafe { std::mem::transmute::<*mut c_void, TimeFn>(p) })
    }

    pub fn real_gettimeofday(&self) -> Result<GettimeofdayFn, SymbolResolutionError> {
        Self::logged(&self.gettimeofday)
            .map(|p| unsafe { std::mem::transmute::<*mut c_void, GettimeofdayFn>(p) })
    }

    pub fn real_getpwnam_r(&self) -> Result<GetpwnamRFn, SymbolResolutionError> {
        Self::logged(&self.getpwnam_r)
            .map(|p| unsafe { std::mem::transmute::<*mut c_void, GetpwnamRFn>(p) })
    }

    pub fn real_getpwuid_r(&self) -> Result<GetpwuidRFn, SymbolResolutionError> {
        Self::logged(&self.getpwuid_r)
            .map(|p| unsafe { std::mem::transmute::<*mut c_void, GetpwuidRFn>(p) })
    }

    pub fn time_resolved(&self) -> bool {
        self.time.is_resolved()
    }

    pub fn gettimeofday_resolved(&self) -> bool {
        self.gettimeofday.is_resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_lazily_and_caches() {
        let resolver = RealFunctionResolver::new();
        assert!(!resolver.time_resolved());
        let first = resolver.real_time().unwrap();
        assert!(resolver.time_resolved());
        let second = resolver.real_time().unwrap();
        assert_eq!(first as usize, second as usize);
    }

    #[test]
    fn real_clock_matches_libc() {
        let resolver = RealFunctionResolver::new();
        let real_time = resolver.real_time().unwrap();
        let ours = unsafe { real_time(ptr::null_mut()) };
        let theirs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as libc::time_t;
        assert!((theirs - ours).abs() <= 1);

        let real_gettimeofday = resolver.real_gettimeofday().unwrap();
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        assert_eq!(unsafe { real_gettimeofday(&mut tv, ptr::null_mut()) }, 0);
        assert!((tv.tv_sec - theirs).abs() <= 1);
    }

    #[test]
    fn missing_symbol_stays_unresolved() {
        let slot = SymbolSlot::new("no_such_fn", c"simshim_no_such_fn", None);
        assert!(slot.resolve().is_err());
        assert!(!slot.is_resolved());
    }
}
