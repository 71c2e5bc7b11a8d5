//! The simulated user directory: `name:uid` records read from `users.sim`
//! once per process.

use std::collections::HashMap;
use std::collections::TryReserveError;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use once_cell::sync::{Lazy, OnceCell};

use crate::error::{LoadError, NotFoundError};

/// Longest user name kept; longer names are truncated.
pub const MAX_NAME_LEN: usize = 99;
/// Number of uid characters considered.
pub const MAX_UID_DIGITS: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedUser {
    pub name: String,
    pub uid: u32,
}

/// Users in file order, indexed both ways. A later record replaces an
/// earlier one with the same name or the same uid in the indexes.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Vec<SimulatedUser>,
    by_name: HashMap<String, usize>,
    by_uid: HashMap<u32, usize>,
}

impl UserTable {
    fn insert(&mut self, user: SimulatedUser) -> Result<(), TryReserveError> {
        self.users.try_reserve(1)?;
        self.by_name.try_reserve(1)?;
        self.by_uid.try_reserve(1)?;
        let mut key = String::new();
        key.try_reserve_exact(user.name.len())?;
        key.push_str(&user.name);

        let idx = self.users.len();
        self.by_name.insert(key, idx);
        self.by_uid.insert(user.uid, idx);
        self.users.push(user);
        Ok(())
    }

    /// Parses records until end of input or a record with an empty name.
    ///
    /// Always returns what was read; the error, if any, says why reading
    /// stopped early.
    pub fn read_from(mut reader: impl BufRead) -> (UserTable, Result<(), LoadError>) {
        let mut table = UserTable::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    let err = LoadError::Io {
                        path: PathBuf::new(),
                        source: e,
                    };
                    return (table, Err(err));
                }
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            let user = match parse_record(&line) {
                Record::End => break,
                Record::Skip => continue,
                Record::User(user) => user,
            };
            debug!("read user {} with uid {}", user.name, user.uid);
            if table.insert(user).is_err() {
                error!("out of memory while loading simulated users");
                let loaded = table.len();
                return (table, Err(LoadError::OutOfMemory { loaded }));
            }
        }
        (table, Ok(()))
    }

    pub fn uid_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|&idx| self.users[idx].uid)
    }

    pub fn name_of(&self, uid: u32) -> Option<&str> {
        self.by_uid.get(&uid).map(|&idx| self.users[idx].name.as_str())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Records in file order, shadowed ones included.
    pub fn iter(&self) -> impl Iterator<Item = &SimulatedUser> {
        self.users.iter()
    }
}

enum Record {
    End,
    Skip,
    User(SimulatedUser),
}

fn parse_record(line: &[u8]) -> Record {
    let (name, uid) = match line.iter().position(|&c| c == b':') {
        Some(colon) => (&line[..colon], Some(&line[colon + 1..])),
        None => (line, None),
    };
    if name.is_empty() {
        return Record::End;
    }

    // Names are matched byte for byte, so a lossy conversion could merge
    // two distinct users.
    let Ok(name) = std::str::from_utf8(name) else {
        warn!(
            "user name {:?} is not valid UTF-8, skipping",
            String::from_utf8_lossy(name)
        );
        return Record::Skip;
    };
    let name = if name.len() > MAX_NAME_LEN {
        warn!("user name {:?} longer than {} bytes, truncating", name, MAX_NAME_LEN);
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        &name[..end]
    } else {
        name
    };
    let name = name.to_string();

    let uid = match uid {
        Some(field) => parse_uid(&name, field),
        None => {
            warn!("user {} has no uid, using 0", name);
            0
        }
    };
    Record::User(SimulatedUser { name, uid })
}

/// Leading decimal digits of the first [`MAX_UID_DIGITS`] characters; `0` if
/// there are none.
fn parse_uid(name: &str, field: &[u8]) -> u32 {
    if field.len() > MAX_UID_DIGITS {
        warn!("uid of user {} longer than {} characters, truncating", name, MAX_UID_DIGITS);
    }
    let field = &field[..field.len().min(MAX_UID_DIGITS)];
    let digits = field.iter().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        warn!(
            "user {} has non-numeric uid {:?}, using 0",
            name,
            String::from_utf8_lossy(field)
        );
        return 0;
    }
    field[..digits]
        .iter()
        .fold(0u32, |acc, c| acc * 10 + u32::from(c - b'0'))
}

/// Loads `users.sim` on first use and keeps it for the life of the process.
#[derive(Debug)]
pub struct IdentityDirectory {
    path: PathBuf,
    table: OnceCell<UserTable>,
}

impl IdentityDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        IdentityDirectory {
            path: path.into(),
            table: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.table.get().is_some()
    }

    /// Reads the users file unless a previous call already did.
    ///
    /// A missing file leaves the directory unloaded, so a later call can
    /// pick it up. An out-of-memory failure keeps the users read so far and
    /// counts as loaded.
    pub fn load(&self) -> Result<&UserTable, LoadError> {
        if let Some(table) = self.table.get() {
            return Ok(table);
        }

        let file = File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound(self.path.clone()),
            _ => LoadError::Io {
                path: self.path.clone(),
                source: e,
            },
        })?;
        debug!("loading simulated users from {}", self.path.display());

        let (table, outcome) = UserTable::read_from(BufReader::new(file));
        let outcome = match outcome {
            Err(LoadError::Io { source, .. }) => {
                return Err(LoadError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
            other => other,
        };

        // A concurrent loader may have won; either table is equivalent.
        let table = self.table.get_or_init(|| table);
        debug!("loaded {} simulated users", table.len());
        outcome.map(|()| table)
    }

    /// The loaded table, or an empty one if the file cannot be read.
    fn table(&self) -> &UserTable {
        static EMPTY: Lazy<UserTable> = Lazy::new(UserTable::default);
        match self.load() {
            Ok(table) => table,
            Err(e) => {
                match &e {
                    LoadError::NotFound(_) => debug!("simulated users unavailable: {}", e),
                    _ => warn!("simulated users unavailable: {}", e),
                }
                self.table.get().unwrap_or(&*EMPTY)
            }
        }
    }

    pub fn lookup_uid_by_name(&self, name: &str) -> Result<u32, NotFoundError> {
        let uid = self.table().uid_of(name);
        debug!("uid for {}: {:?}", name, uid);
        uid.ok_or_else(|| NotFoundError::Name(name.to_string()))
    }

    /// Returns an owned copy of the name.
    pub fn lookup_name_by_uid(&self, uid: u32) -> Result<String, NotFoundError> {
        let name = self.table().name_of(uid).map(str::to_string);
        debug!("name for uid {}: {:?}", uid, name);
        name.ok_or(NotFoundError::Uid(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn table(content: &str) -> UserTable {
        let (table, outcome) = UserTable::read_from(Cursor::new(content.as_bytes().to_vec()));
        outcome.unwrap();
        table
    }

    #[test]
    fn reads_name_uid_records() {
        let t = table("alice:1001\nbob:1002\n");
        assert_eq!(t.len(), 2);
        assert_eq!(t.uid_of("alice"), Some(1001));
        assert_eq!(t.name_of(1002), Some("bob"));
        assert_eq!(t.uid_of("carol"), None);
        assert_eq!(t.uid_of("Alice"), None);
    }

    #[test]
    fn last_record_without_newline() {
        let t = table("alice:1001\nbob:1002");
        assert_eq!(t.uid_of("bob"), Some(1002));
    }

    #[test]
    fn blank_line_ends_the_directory() {
        let t = table("alice:1001\n\nbob:1002\n");
        assert_eq!(t.len(), 1);
        assert_eq!(t.uid_of("bob"), None);

        let t = table("alice:1001\n:1002\nbob:1003\n");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(table("").is_empty());
    }

    #[test]
    fn later_records_shadow_earlier_ones() {
        let t = table("alice:1001\nalice:2001\nbob:2001\n");
        assert_eq!(t.uid_of("alice"), Some(2001));
        assert_eq!(t.name_of(2001), Some("bob"));
        assert_eq!(t.name_of(1001), Some("alice"));
        assert_eq!(t.iter().count(), 3);
    }

    #[test]
    fn malformed_uids_become_zero() {
        let t = table("nouid\nbad:abc\nempty:\npartial:12x4\n");
        assert_eq!(t.uid_of("nouid"), Some(0));
        assert_eq!(t.uid_of("bad"), Some(0));
        assert_eq!(t.uid_of("empty"), Some(0));
        assert_eq!(t.uid_of("partial"), Some(12));
    }

    #[test]
    fn long_fields_are_truncated() {
        let long_name = "n".repeat(150);
        let t = table(&format!("{}:1234567890123\n", long_name));
        let user = t.iter().next().unwrap();
        assert_eq!(user.name.len(), MAX_NAME_LEN);
        assert_eq!(user.uid, 123_456_789);
    }

    #[test]
    fn names_that_are_not_utf8_are_skipped() {
        let (t, outcome) =
            UserTable::read_from(Cursor::new(b"caf\xff:1001\ncaf\xfe:1002\nbob:1003\n".to_vec()));
        outcome.unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.uid_of("caf\u{FFFD}"), None);
        assert_eq!(t.name_of(1001), None);
        assert_eq!(t.name_of(1002), None);
        assert_eq!(t.uid_of("bob"), Some(1003));
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        let name = format!("{}é", "n".repeat(MAX_NAME_LEN - 1));
        let t = table(&format!("{}:5\n", name));
        assert_eq!(t.iter().next().unwrap().name, "n".repeat(MAX_NAME_LEN - 1));
    }

    #[test]
    fn missing_file_is_not_found_and_retried() {
        let dir = std::env::temp_dir().join(format!("simshim-missing-{}", std::process::id()));
        let directory = IdentityDirectory::new(dir.join("users.sim"));
        assert!(matches!(directory.load(), Err(LoadError::NotFound(_))));
        assert!(!directory.is_loaded());
        assert_eq!(
            directory.lookup_uid_by_name("alice"),
            Err(NotFoundError::Name("alice".to_string()))
        );
    }
}
