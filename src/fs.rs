//! Host capabilities: filesystem metadata, OS identity, and the
//! relative-path policy applied to every archive name.
//!
//! The writer only observes the filesystem through [`Filesystem`] and
//! [`Identity`]; file *content* is read with plain `std::fs` by the writer
//! itself. [`UnixHost`] is the production implementation on top of rustix
//! (stat, readlink, directory enumeration) and nix (passwd lookups).

use std::{
    collections::HashMap,
    ffi::OsString,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use rustix::fs::{Dir, FileType, Mode, OFlags};

use crate::error::{Error, Result};
use crate::format::EntryKind;

/// Opaque host-unique identity of a filesystem object, comparable for
/// equality. Two paths with the same `FileId` refer to the same storage
/// object, which is what hard-link coalescing keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

/// Observational filesystem operations the writer consumes. Symlinks are
/// classified as symlinks (never as their target) by `kind`.
pub trait Filesystem {
    fn exists(&self, path: &Path) -> bool;

    /// Classifies the object at `path` without following symlinks. Fails
    /// with `NotFound` for missing paths and `Unsupported` for sockets and
    /// unknown object types.
    fn kind(&self, path: &Path) -> Result<EntryKind>;

    fn size(&self, path: &Path) -> Result<u64>;

    /// Modification time in seconds since the Unix epoch.
    fn mtime(&self, path: &Path) -> Result<i64>;

    /// The lower 12 permission bits.
    fn mode(&self, path: &Path) -> Result<u32>;

    fn read_symlink(&self, path: &Path) -> Result<PathBuf>;

    fn realpath(&self, path: &Path) -> Result<PathBuf>;

    /// Names of the children of a directory, byte-sorted. This is the
    /// primitive [`walk`] and the recursive admission path build on; the
    /// sort is what makes walks deterministic.
    fn read_dir_sorted(&self, path: &Path) -> Result<Vec<OsString>>;
}

/// OS identity operations: process ids, passwd/group name resolution and
/// per-file ownership. Name lookups fall back to the decimal id when no
/// database entry exists; only real I/O failures are errors.
pub trait Identity {
    fn user_id(&self) -> u32;
    fn group_id(&self) -> u32;
    fn user_name(&self, uid: u32) -> Result<String>;
    fn group_name(&self, gid: u32) -> Result<String>;
    fn file_owner(&self, path: &Path) -> Result<u32>;
    fn file_group(&self, path: &Path) -> Result<u32>;
    fn major_minor(&self, path: &Path) -> Result<(u32, u32)>;
    fn inode(&self, path: &Path) -> Result<FileId>;
    fn path_separator(&self) -> char;
}

/// The combined capability set a writer is constructed over.
pub trait Host: Filesystem + Identity {}
impl<T: Filesystem + Identity> Host for T {}

/// Visits `path` and, if it is a directory, every descendant in
/// deterministic name-sorted pre-order (parents before children).
///
/// Every entry kind is reported to `visit`; filtering by format capability
/// is the admission layer's business. Objects whose kind cannot be
/// determined (sockets, say) are still visited — there is just nothing to
/// descend into.
pub fn walk<F: Filesystem + ?Sized>(
    fs: &F,
    path: &Path,
    visit: &mut dyn FnMut(&Path) -> Result<()>,
) -> Result<()> {
    visit(path)?;
    match fs.kind(path) {
        Ok(EntryKind::Directory) => {
            for name in fs.read_dir_sorted(path)? {
                walk(fs, &path.join(name), visit)?;
            }
            Ok(())
        }
        Ok(_) | Err(Error::Unsupported(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Applies the relative-path policy to a prospective archive name: leading
/// `/` and leading `..` components are stripped, recursively. Archiving the
/// filesystem root itself is refused. The exact input `"../"` maps to
/// `"./"`, a marker kept for transparency.
pub fn clean_path(path: &str) -> Result<String> {
    if path == "/" {
        return Err(Error::invalid("cannot archive the rootfs"));
    }
    if path == "../" {
        return Ok("./".to_string());
    }

    let mut s = path;
    loop {
        if let Some(rest) = s.strip_prefix('/') {
            s = rest;
        } else if let Some(rest) = s.strip_prefix("../") {
            s = rest;
        } else if s == ".." {
            s = "";
        } else {
            break;
        }
    }
    Ok(s.to_string())
}

pub(crate) fn path_to_name(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::invalid(format!("path is not valid UTF-8: {path:?}")))
}

/// Per-writer memoization of uid→name / gid→name lookups: for the lifetime
/// of one writer, each id is resolved against the OS at most once.
#[derive(Debug, Default)]
pub(crate) struct NameCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache {
    pub fn user_name<I: Identity + ?Sized>(&mut self, id: &I, uid: u32) -> Result<String> {
        if let Some(name) = self.users.get(&uid) {
            return Ok(name.clone());
        }
        let name = id.user_name(uid)?;
        self.users.insert(uid, name.clone());
        Ok(name)
    }

    pub fn group_name<I: Identity + ?Sized>(&mut self, id: &I, gid: u32) -> Result<String> {
        if let Some(name) = self.groups.get(&gid) {
            return Ok(name.clone());
        }
        let name = id.group_name(gid)?;
        self.groups.insert(gid, name.clone());
        Ok(name)
    }
}

/// The production host: rustix for metadata, nix for the passwd and group
/// databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixHost;

fn errno_error(errno: rustix::io::Errno, path: &Path) -> Error {
    if errno == rustix::io::Errno::NOENT {
        Error::NotFound(path.to_owned())
    } else {
        Error::Io(errno.into())
    }
}

impl UnixHost {
    fn lstat(&self, path: &Path) -> Result<rustix::fs::Stat> {
        rustix::fs::lstat(path).map_err(|e| errno_error(e, path))
    }
}

impl Filesystem for UnixHost {
    fn exists(&self, path: &Path) -> bool {
        rustix::fs::lstat(path).is_ok()
    }

    fn kind(&self, path: &Path) -> Result<EntryKind> {
        let st = self.lstat(path)?;
        match FileType::from_raw_mode(st.st_mode) {
            // symlinks classify as symlinks, never as their target
            FileType::Symlink => Ok(EntryKind::Symlink),
            FileType::RegularFile => Ok(EntryKind::Regular),
            FileType::Directory => Ok(EntryKind::Directory),
            FileType::CharacterDevice => Ok(EntryKind::CharDevice),
            FileType::BlockDevice => Ok(EntryKind::BlockDevice),
            FileType::Fifo => Ok(EntryKind::Fifo),
            FileType::Socket | FileType::Unknown => Err(Error::unsupported(format!(
                "cannot archive {path:?}: socket or unknown object type"
            ))),
        }
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(self.lstat(path)?.st_size as u64)
    }

    fn mtime(&self, path: &Path) -> Result<i64> {
        Ok(self.lstat(path)?.st_mtime as i64)
    }

    fn mode(&self, path: &Path) -> Result<u32> {
        Ok(self.lstat(path)?.st_mode & 0o7777)
    }

    fn read_symlink(&self, path: &Path) -> Result<PathBuf> {
        let target = rustix::fs::readlink(path, Vec::new()).map_err(|e| errno_error(e, path))?;
        Ok(PathBuf::from(OsString::from_vec(target.into_bytes())))
    }

    fn realpath(&self, path: &Path) -> Result<PathBuf> {
        std::fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.to_owned())
            } else {
                Error::Io(e)
            }
        })
    }

    fn read_dir_sorted(&self, path: &Path) -> Result<Vec<OsString>> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| errno_error(e, path))?;

        let mut names = Vec::new();
        for item in Dir::read_from(&fd).map_err(|e| errno_error(e, path))? {
            let entry = item.map_err(|e| errno_error(e, path))?;
            let name = entry.file_name().to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            names.push(OsString::from_vec(name.to_vec()));
        }
        names.sort();
        Ok(names)
    }
}

impl Identity for UnixHost {
    fn user_id(&self) -> u32 {
        rustix::process::geteuid().as_raw()
    }

    fn group_id(&self) -> u32 {
        rustix::process::getegid().as_raw()
    }

    fn user_name(&self, uid: u32) -> Result<String> {
        match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
            Ok(Some(user)) => Ok(user.name),
            // no passwd entry: the decimal id stands in for the name
            Ok(None) => Ok(uid.to_string()),
            Err(errno) => Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32))),
        }
    }

    fn group_name(&self, gid: u32) -> Result<String> {
        match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
            Ok(Some(group)) => Ok(group.name),
            Ok(None) => Ok(gid.to_string()),
            Err(errno) => Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32))),
        }
    }

    fn file_owner(&self, path: &Path) -> Result<u32> {
        Ok(self.lstat(path)?.st_uid)
    }

    fn file_group(&self, path: &Path) -> Result<u32> {
        Ok(self.lstat(path)?.st_gid)
    }

    fn major_minor(&self, path: &Path) -> Result<(u32, u32)> {
        let st = self.lstat(path)?;
        Ok((rustix::fs::major(st.st_rdev), rustix::fs::minor(st.st_rdev)))
    }

    fn inode(&self, path: &Path) -> Result<FileId> {
        let st = self.lstat(path)?;
        Ok(FileId::new(st.st_dev as u64, st.st_ino as u64))
    }

    fn path_separator(&self) -> char {
        '/'
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/b").unwrap(), "a/b");
        assert_eq!(clean_path("/tmp/t").unwrap(), "tmp/t");
        assert_eq!(clean_path("//x").unwrap(), "x");
        assert_eq!(clean_path("../x").unwrap(), "x");
        assert_eq!(clean_path("../../x").unwrap(), "x");
        assert_eq!(clean_path("/../x").unwrap(), "x");
        assert_eq!(clean_path("..").unwrap(), "");
        assert_eq!(clean_path("/..").unwrap(), "");
        assert_eq!(clean_path("../").unwrap(), "./");
        assert!(matches!(clean_path("/"), Err(Error::Invalid(_))));
        // interior components are left for the admission layer to judge
        assert_eq!(clean_path("a/../b").unwrap(), "a/../b");
    }

    #[test]
    fn test_kind_classification() {
        let dir = tempfile::tempdir().unwrap();
        let host = UnixHost;

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(host.kind(&file).unwrap(), EntryKind::Regular);
        assert_eq!(host.kind(dir.path()).unwrap(), EntryKind::Directory);

        let link = dir.path().join("l");
        std::os::unix::fs::symlink(&file, &link).unwrap();
        // the symlink itself, not its target
        assert_eq!(host.kind(&link).unwrap(), EntryKind::Symlink);
        assert_eq!(host.read_symlink(&link).unwrap(), file);

        assert!(matches!(
            host.kind(&dir.path().join("missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_walk_preorder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("z"), b"").unwrap();

        let mut seen = Vec::new();
        walk(&UnixHost, dir.path(), &mut |p| {
            seen.push(p.strip_prefix(dir.path()).unwrap().to_owned());
            Ok(())
        })
        .unwrap();

        let expected: Vec<PathBuf> = ["", "a", "sub", "sub/inner", "z"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_name_lookup_fallback() {
        let host = UnixHost;
        // this uid should not exist in any sane passwd database
        assert_eq!(host.user_name(0x3fff_fff1).unwrap(), "1073741809");
        assert_eq!(host.group_name(0x3fff_fff1).unwrap(), "1073741809");
    }

    #[test]
    fn test_name_cache_queries_once() {
        struct CountingIdentity(Cell<u32>);
        impl Identity for CountingIdentity {
            fn user_id(&self) -> u32 {
                0
            }
            fn group_id(&self) -> u32 {
                0
            }
            fn user_name(&self, uid: u32) -> Result<String> {
                self.0.set(self.0.get() + 1);
                Ok(format!("user{uid}"))
            }
            fn group_name(&self, gid: u32) -> Result<String> {
                self.0.set(self.0.get() + 1);
                Ok(format!("group{gid}"))
            }
            fn file_owner(&self, _: &Path) -> Result<u32> {
                Ok(0)
            }
            fn file_group(&self, _: &Path) -> Result<u32> {
                Ok(0)
            }
            fn major_minor(&self, _: &Path) -> Result<(u32, u32)> {
                Ok((0, 0))
            }
            fn inode(&self, _: &Path) -> Result<FileId> {
                Ok(FileId::new(0, 0))
            }
            fn path_separator(&self) -> char {
                '/'
            }
        }

        let id = CountingIdentity(Cell::new(0));
        let mut cache = NameCache::default();
        assert_eq!(cache.user_name(&id, 7).unwrap(), "user7");
        assert_eq!(cache.user_name(&id, 7).unwrap(), "user7");
        assert_eq!(cache.group_name(&id, 7).unwrap(), "group7");
        assert_eq!(cache.group_name(&id, 7).unwrap(), "group7");
        assert_eq!(id.0.get(), 2);
    }
}
