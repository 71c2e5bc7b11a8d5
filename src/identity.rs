use std::ffi::{CStr, CString};
use std::ptr;

use log::{debug, error};

use crate::error::NotFoundError;
use crate::resolver::RealFunctionResolver;
use crate::users::IdentityDirectory;

/// Group id reported for every simulated user ("users" on most systems).
pub const PLACEHOLDER_GID: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// Something that can answer `getpwnam_r(3)` and `getpwuid_r(3)`.
pub trait IdentitySource {
    fn resolve_by_name(&self, name: &str) -> Result<IdentityRecord, NotFoundError>;
    fn resolve_by_uid(&self, uid: u32) -> Result<IdentityRecord, NotFoundError>;
}

/// Identities from the simulated user directory.
pub struct SimulatedIdentity<'a> {
    directory: &'a IdentityDirectory,
}

impl<'a> SimulatedIdentity<'a> {
    pub fn new(directory: &'a IdentityDirectory) -> Self {
        SimulatedIdentity { directory }
    }
}

impl IdentitySource for SimulatedIdentity<'_> {
    fn resolve_by_name(&self, name: &str) -> Result<IdentityRecord, NotFoundError> {
        let uid = self.directory.lookup_uid_by_name(name)?;
        Ok(IdentityRecord {
            name: name.to_string(),
            uid,
            gid: PLACEHOLDER_GID,
        })
    }

    fn resolve_by_uid(&self, uid: u32) -> Result<IdentityRecord, NotFoundError> {
        let name = self.directory.lookup_name_by_uid(uid)?;
        Ok(IdentityRecord {
            name,
            uid,
            gid: PLACEHOLDER_GID,
        })
    }
}

/// Identities from the system's own user database, through the resolved
/// libc functions.
pub struct RealIdentity<'a> {
    resolver: &'a RealFunctionResolver,
}

const INITIAL_PASSWD_BUF: usize = 1024;
const MAX_PASSWD_BUF: usize = 1 << 20;

impl<'a> RealIdentity<'a> {
    pub fn new(resolver: &'a RealFunctionResolver) -> Self {
        RealIdentity { resolver }
    }

    /// Runs a `getpw*_r` style call, growing the buffer on `ERANGE`.
    fn query(
        &self,
        call: impl Fn(&mut libc::passwd, &mut [u8], &mut *mut libc::passwd) -> libc::c_int,
    ) -> Option<IdentityRecord> {
        let mut buf = vec![0u8; INITIAL_PASSWD_BUF];
        loop {
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = ptr::null_mut();
            let rc = call(&mut pwd, &mut buf, &mut result);
            if rc == libc::ERANGE && buf.len() < MAX_PASSWD_BUF {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            if rc != 0 {
                error!(
                    "system user lookup failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
                return None;
            }
            if result.is_null() {
                return None;
            }
            let name = unsafe { CStr::from_ptr(pwd.pw_name) }
                .to_string_lossy()
                .into_owned();
            return Some(IdentityRecord {
                name,
                uid: pwd.pw_uid,
                gid: pwd.pw_gid,
            });
        }
    }
}

impl IdentitySource for RealIdentity<'_> {
    fn resolve_by_name(&self, name: &str) -> Result<IdentityRecord, NotFoundError> {
        let not_found = || NotFoundError::Name(name.to_string());
        let cname = CString::new(name).map_err(|_| not_found())?;
        let getpwnam_r = self.resolver.real_getpwnam_r().map_err(|_| not_found())?;
        self.query(|pwd, buf, result| unsafe {
            getpwnam_r(
                cname.as_ptr(),
                pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                result,
            )
        })
        .ok_or_else(not_found)
    }

    fn resolve_by_uid(&self, uid: u32) -> Result<IdentityRecord, NotFoundError> {
        let getpwuid_r = self
            .resolver
            .real_getpwuid_r()
            .map_err(|_| NotFoundError::Uid(uid))?;
        self.query(|pwd, buf, result| unsafe {
            getpwuid_r(
                uid,
                pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                result,
            )
        })
        .ok_or(NotFoundError::Uid(uid))
    }
}

/// Fills a C `passwd` for `record`, storing its strings in `buf`: the name,
/// then one empty string shared by the password, gecos, home and shell
/// fields.
///
/// # Safety
///
/// `buf` must be valid for `buflen` bytes of writes and outlive every use of
/// `pwd`.
pub unsafe fn fill_passwd(
    record: &IdentityRecord,
    pwd: &mut libc::passwd,
    buf: *mut libc::c_char,
    buflen: usize,
) -> Result<(), libc::c_int> {
    let name = record.name.as_bytes();
    let needed = name.len() + 2;
    if buf.is_null() || buflen < needed {
        debug!("passwd buffer of {} bytes too small, need {}", buflen, needed);
        return Err(libc::ERANGE);
    }
    let buf = buf as *mut u8;
    unsafe {
        ptr::copy_nonoverlapping(name.as_ptr(), buf, name.len());
        *buf.add(name.len()) = 0;
        *buf.add(name.len() + 1) = 0;
    }
    let empty = unsafe { buf.add(name.len() + 1) } as *mut libc::c_char;

    pwd.pw_name = buf as *mut libc::c_char;
    pwd.pw_passwd = empty;
    pwd.pw_uid = record.uid;
    pwd.pw_gid = record.gid;
    pwd.pw_gecos = empty;
    pwd.pw_dir = empty;
    pwd.pw_shell = empty;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn directory(content: &str) -> (tempfile::TempDir, IdentityDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.sim");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        (dir, IdentityDirectory::new(path))
    }

    #[test]
    fn simulated_records() {
        let (_dir, users) = directory("alice:1001\nbob:1002\n");
        let identity = SimulatedIdentity::new(&users);
        assert_eq!(
            identity.resolve_by_name("alice").unwrap(),
            IdentityRecord {
                name: "alice".to_string(),
                uid: 1001,
                gid: PLACEHOLDER_GID
            }
        );
        assert_eq!(identity.resolve_by_uid(1002).unwrap().name, "bob");
        assert_eq!(
            identity.resolve_by_name("carol"),
            Err(NotFoundError::Name("carol".to_string()))
        );
        assert_eq!(identity.resolve_by_uid(7), Err(NotFoundError::Uid(7)));
    }

    #[test]
    fn real_identity_knows_root() {
        let resolver = RealFunctionResolver::new();
        let identity = RealIdentity::new(&resolver);
        let root = identity.resolve_by_uid(0).unwrap();
        assert_eq!(root.name, "root");
        assert_eq!(identity.resolve_by_name("root").unwrap().uid, 0);
        assert!(identity
            .resolve_by_name("simshim-no-such-user-xyz")
            .is_err());
    }

    #[test]
    fn fill_passwd_uses_caller_buffer() {
        let record = IdentityRecord {
            name: "alice".to_string(),
            uid: 1001,
            gid: PLACEHOLDER_GID,
        };
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = [0x7f as libc::c_char; 16];
        unsafe { fill_passwd(&record, &mut pwd, buf.as_mut_ptr(), buf.len()) }.unwrap();
        assert_eq!(unsafe { CStr::from_ptr(pwd.pw_name) }.to_str().unwrap(), "alice");
        assert_eq!(unsafe { CStr::from_ptr(pwd.pw_dir) }.to_bytes(), b"");
        assert_eq!(pwd.pw_uid, 1001);
        assert_eq!(pwd.pw_gid, 100);

        let mut small = [0 as libc::c_char; 6];
        assert_eq!(
            unsafe { fill_passwd(&record, &mut pwd, small.as_mut_ptr(), small.len()) },
            Err(libc::ERANGE)
        );
    }
}
