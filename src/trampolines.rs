//! C entry points exported when the library is preloaded into an unmodified
//! program. Each one hands off to the process-wide [`SimContext`].

use std::ffi::{c_void, CStr};

use crate::clock::ClockSource;
use crate::identity::{fill_passwd, IdentityRecord, IdentitySource};
use crate::SimContext;

#[small_ctor::ctor]
unsafe fn init_on_load() {
    crate::init();
}

fn time_in(ctx: &SimContext, t: *mut libc::time_t) -> libc::time_t {
    let res = ctx.clock().time() as libc::time_t;
    if !t.is_null() {
        unsafe {
            *t = res;
        }
    }
    res
}

fn gettimeofday_in(ctx: &SimContext, tp: *mut libc::timeval) -> libc::c_int {
    if !tp.is_null() {
        let res = ctx.clock().time_of_day();
        unsafe {
            (*tp).tv_sec = res.seconds as libc::time_t;
            (*tp).tv_usec = res.micros as libc::suseconds_t;
        }
    }
    0
}

/// Not found is `0` with `*result` set to null, as POSIX specifies.
unsafe fn answer(
    found: Option<IdentityRecord>,
    pwd: *mut libc::passwd,
    buf: *mut libc::c_char,
    buflen: libc::size_t,
    result: *mut *mut libc::passwd,
) -> libc::c_int {
    if result.is_null() {
        return libc::EINVAL;
    }
    unsafe { *result = std::ptr::null_mut() };
    let Some(record) = found else {
        return 0;
    };
    if pwd.is_null() {
        return libc::EINVAL;
    }
    match unsafe { fill_passwd(&record, &mut *pwd, buf, buflen) } {
        Ok(()) => {
            unsafe { *result = pwd };
            0
        }
        Err(errno) => errno,
    }
}

/// Names that are not UTF-8 cannot be in the directory, so they miss.
unsafe fn by_name(ctx: &SimContext, name: *const libc::c_char) -> Option<IdentityRecord> {
    if name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) }.to_str().ok()?;
    ctx.identity().resolve_by_name(name).ok()
}

#[no_mangle]
pub extern "C" fn time(t: *mut libc::time_t) -> libc::time_t {
    time_in(crate::init(), t)
}

/// The timezone argument is ignored, as it is by modern libc.
#[no_mangle]
pub extern "C" fn gettimeofday(tp: *mut libc::timeval, _tz: *mut c_void) -> libc::c_int {
    gettimeofday_in(crate::init(), tp)
}

#[no_mangle]
pub unsafe extern "C" fn getpwnam_r(
    name: *const libc::c_char,
    pwd: *mut libc::passwd,
    buf: *mut libc::c_char,
    buflen: libc::size_t,
    result: *mut *mut libc::passwd,
) -> libc::c_int {
    let found = unsafe { by_name(crate::init(), name) };
    unsafe { answer(found, pwd, buf, buflen, result) }
}

#[no_mangle]
pub unsafe extern "C" fn getpwuid_r(
    uid: libc::uid_t,
    pwd: *mut libc::passwd,
    buf: *mut libc::c_char,
    buflen: libc::size_t,
    result: *mut *mut libc::passwd,
) -> libc::c_int {
    let found = crate::init().identity().resolve_by_uid(uid).ok();
    unsafe { answer(found, pwd, buf, buflen, result) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SharedRegion, ShimConfig};
    use std::io::Write;
    use std::ptr;

    fn context(tag: &str) -> (tempfile::TempDir, SimContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("users.sim"))
            .unwrap()
            .write_all(b"alice:1001\nbob:1002\ncaf\xc3\xa9:1003\n")
            .unwrap();
        let config = ShimConfig::default()
            .with_region_name(format!("/simshim_tramp_{}_{}", tag, std::process::id()))
            .with_users_dir(dir.path());
        (dir, SimContext::new(config))
    }

    fn lookup_name(
        ctx: &SimContext,
        name: &CStr,
        buflen: usize,
    ) -> (libc::c_int, Option<(String, u32, u32)>) {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; buflen];
        let mut result: *mut libc::passwd = ptr::null_mut();
        let found = unsafe { by_name(ctx, name.as_ptr()) };
        let rc = unsafe { answer(found, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
        let entry = (!result.is_null()).then(|| {
            let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_str().unwrap().to_string();
            (name, pwd.pw_uid, pwd.pw_gid)
        });
        (rc, entry)
    }

    #[test]
    fn getpwnam_style_lookups() {
        let (_dir, ctx) = context("nam");
        assert_eq!(
            lookup_name(&ctx, c"alice", 64),
            (0, Some(("alice".to_string(), 1001, 100)))
        );
        assert_eq!(
            lookup_name(&ctx, c"caf\xc3\xa9", 64),
            (0, Some(("café".to_string(), 1003, 100)))
        );
        assert_eq!(lookup_name(&ctx, c"carol", 64), (0, None));
        assert_eq!(lookup_name(&ctx, c"caf\xff", 64), (0, None));
        assert_eq!(lookup_name(&ctx, c"alice", 4), (libc::ERANGE, None));
    }

    #[test]
    fn answer_reports_bad_arguments() {
        let (_dir, ctx) = context("args");
        let found = ctx.identity().resolve_by_uid(1002).ok();
        assert!(found.is_some());
        let mut buf = [0 as libc::c_char; 64];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let rc = unsafe { answer(found.clone(), &mut pwd, buf.as_mut_ptr(), 64, ptr::null_mut()) };
        assert_eq!(rc, libc::EINVAL);

        let mut result: *mut libc::passwd = ptr::null_mut();
        let rc = unsafe { answer(found, ptr::null_mut(), buf.as_mut_ptr(), 64, &mut result) };
        assert_eq!(rc, libc::EINVAL);
        assert!(result.is_null());

        assert!(unsafe { by_name(&ctx, ptr::null()) }.is_none());
    }

    #[test]
    fn exported_identity_functions() {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = [0 as libc::c_char; 64];
        let rc = unsafe {
            getpwnam_r(c"alice".as_ptr(), &mut pwd, buf.as_mut_ptr(), 64, ptr::null_mut())
        };
        assert_eq!(rc, libc::EINVAL);

        // The global context reads users.sim from wherever SLURM_CONF points,
        // so only the not-found shape is certain here.
        let mut stale: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = &mut stale;
        let rc = unsafe {
            getpwuid_r(u32::MAX - 7, &mut pwd, buf.as_mut_ptr(), 64, &mut result)
        };
        assert_eq!(rc, 0);
        assert!(result.is_null());
    }

    #[test]
    fn time_writes_through_the_pointer() {
        let (_dir, ctx) = context("time");
        let region = ctx.region().ensure_attached().unwrap();
        region.set_simulated_seconds(1000);
        region.set_simulated_micros(0);

        let mut t: libc::time_t = 0;
        assert_eq!(time_in(&ctx, &mut t), 1000);
        assert_eq!(t, 1000);
        assert_eq!(time_in(&ctx, ptr::null_mut()), 1000);

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        assert_eq!(gettimeofday_in(&ctx, &mut tv), 0);
        assert_eq!((tv.tv_sec, tv.tv_usec), (1000, 100));
        assert_eq!(gettimeofday_in(&ctx, ptr::null_mut()), 0);
        // A null pointer is not a read, so the counter did not move.
        assert_eq!(region.simulated_micros(), 100);

        SharedRegion::remove(ctx.config().region_name()).unwrap();
    }

    #[test]
    fn exported_clock_functions() {
        let mut t: libc::time_t = -1;
        let returned = time(&mut t);
        assert_eq!(t, returned);
        assert!(time(ptr::null_mut()) >= returned);
        assert_eq!(gettimeofday(ptr::null_mut(), ptr::null_mut()), 0);

        let mut tv = libc::timeval {
            tv_sec: -1,
            tv_usec: -1,
        };
        assert_eq!(gettimeofday(&mut tv, ptr::null_mut()), 0);
        assert!(tv.tv_sec >= 0);
    }
}
