// Copyright 2024 contributors to BeholdFS.

//! The thin FUSE translator (spec §6, §7) — out of the core's scope
//! (§1), included so the crate is a runnable filesystem.
//!
//! Grounded on `ToxicMushroom-tagfs`'s `fuser::Filesystem` impl for the
//! handler shapes (`lookup`/`getattr`/`mkdir`/`unlink`/`rename`) and on
//! conserve's `mount.rs` for the idea of a thin host-facing adapter
//! sitting in front of a self-contained core. The inode table below has
//! no teacher counterpart (conserve's Windows ProjFS source is
//! inode-free and its `mount/unix.rs` is an unimplemented stub); it
//! follows the standard FUSE passthrough pattern of interning
//! `(real_path, filter)` pairs and reference-counting them via
//! `forget`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
};
use tracing::{trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::filter;
use crate::iter::EntryKind;
use crate::mutate;
use crate::path::{parse_path, Filter, ParsedPath};
use crate::session::Session;
use crate::store::schema::ObjectKind;
use crate::store::MetadataStore;

const TTL: Duration = Duration::from_secs(1);
const XATTR_TAGS: &str = "user.tags";

fn errno_for(err: &Error) -> i32 {
    match err {
        Error::MalformedPath { .. } => libc::ENOENT,
        Error::NotFound { .. } => libc::ENOENT,
        Error::Hidden { .. } => libc::EACCES,
        Error::Exists { .. } => libc::EEXIST,
        Error::VersionTooNew { .. } => libc::ENOTSUP,
        Error::Internal { .. } => libc::EIO,
        Error::Io(_) => libc::EIO,
        Error::Sqlite(_) => libc::EIO,
    }
}

macro_rules! try_reply {
    ($result:expr, $reply:ident) => {
        match $result {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "operation failed");
                $reply.error(errno_for(&e));
                return;
            }
        }
    };
}

/// One interned (real path, accumulated filter) pair, the FUSE
/// equivalent of a [`ParsedPath`] kept alive across a lookup chain —
/// the kernel hands us one path component per call instead of a whole
/// string, so the accumulation [`ParsedPath`] normally does in one pass
/// (spec §4.1) happens here one `lookup()` at a time instead.
struct Inode {
    real_path: PathBuf,
    filter: Filter,
    lookups: u64,
}

struct Inodes {
    next_ino: u64,
    entries: HashMap<u64, Inode>,
    index: HashMap<(PathBuf, Filter), u64>,
}

impl Inodes {
    fn new() -> Inodes {
        let root = Inode {
            real_path: PathBuf::from("."),
            filter: Filter::default(),
            lookups: 1,
        };
        let mut entries = HashMap::new();
        let mut index = HashMap::new();
        index.insert((root.real_path.clone(), root.filter.clone()), 1);
        entries.insert(1, root);
        Inodes {
            next_ino: 2,
            entries,
            index,
        }
    }

    fn get(&self, ino: u64) -> Option<(PathBuf, Filter)> {
        self.entries.get(&ino).map(|e| (e.real_path.clone(), e.filter.clone()))
    }

    fn intern(&mut self, real_path: PathBuf, filter: Filter) -> u64 {
        let key = (real_path.clone(), filter.clone());
        if let Some(&ino) = self.index.get(&key) {
            self.entries.get_mut(&ino).unwrap().lookups += 1;
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            Inode {
                real_path,
                filter,
                lookups: 1,
            },
        );
        self.index.insert(key, ino);
        ino
    }

    /// Invalidate every interning of `real_path` (used after a rename
    /// or delete so a stale inode never outlives the object it named).
    fn invalidate(&mut self, real_path: &Path) {
        let dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.real_path == real_path)
            .map(|(&ino, _)| ino)
            .collect();
        for ino in dead {
            if let Some(entry) = self.entries.remove(&ino) {
                self.index.remove(&(entry.real_path, entry.filter));
            }
        }
    }

    fn forget(&mut self, ino: u64, n: u64) {
        if ino == 1 {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(n);
        if entry.lookups == 0 {
            let key = (entry.real_path.clone(), entry.filter.clone());
            self.entries.remove(&ino);
            self.index.remove(&key);
        }
    }
}

/// Which [`ObjectKind`] the `user.tags` xattr interception should use
/// for the object at `abs` — the metadata store tracks files and
/// directories as distinct kinds (spec §3), so retagging needs to know
/// which row to touch.
fn object_kind_of(abs: &Path) -> crate::error::Result<ObjectKind> {
    let meta = fs::symlink_metadata(abs)?;
    Ok(if meta.is_dir() {
        ObjectKind::Directory
    } else {
        ObjectKind::File
    })
}

fn real_components(real_path: &Path) -> Vec<String> {
    real_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        _ => FileType::RegularFile,
    }
}

fn attr_from_metadata(ino: u64, meta: &fs::Metadata) -> FileAttr {
    let mode = meta.mode();
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks() as u64,
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(mode),
        perm: (mode & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// `dr-xr-xr-x`, link count 1, as required for a synthetic tag-listing
/// entry (spec §4.6) — there is no backing inode to stat.
fn synthetic_tag_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

pub struct BeholdFs {
    fsroot: PathBuf,
    config: Config,
    inodes: Mutex<Inodes>,
    files: Mutex<HashMap<u64, fs::File>>,
    dirs: Mutex<HashMap<u64, Session>>,
    next_fh: Mutex<u64>,
}

impl BeholdFs {
    pub fn new(fsroot: PathBuf, config: Config) -> BeholdFs {
        BeholdFs {
            fsroot,
            config,
            inodes: Mutex::new(Inodes::new()),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_fh: Mutex::new(1),
        }
    }

    fn abs(&self, real_path: &Path) -> PathBuf {
        let mut p = self.fsroot.clone();
        for c in real_path.components() {
            if c.as_os_str() != "." {
                p.push(c);
            }
        }
        p
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock().unwrap();
        let fh = *next;
        *next += 1;
        fh
    }

    /// Resolve one path component below `parent`, mirroring what the
    /// parser's single forward pass does for one segment of a full
    /// string (spec §4.1): classify it as a tag segment or a real name
    /// by feeding it back through [`parse_path`] as a synthetic
    /// one-segment path, then fold the result onto the parent's already
    /// accumulated filter.
    fn resolve(&self, parent_real: &Path, parent_filter: &Filter, name: &OsStr) -> crate::error::Result<(PathBuf, Filter)> {
        if parent_filter.listing {
            // Nothing may be looked up below a bare tag-listing segment
            // (spec §4.1 rule 3, and the parser's stricter reading
            // recorded in DESIGN.md): it is only ever a leaf.
            return Err(Error::malformed_path(name.to_string_lossy()));
        }
        let name_str = name
            .to_str()
            .ok_or_else(|| Error::malformed_path(name.to_string_lossy()))?;
        let synthetic = format!("/{name_str}");
        let parsed = parse_path(&synthetic, &self.config, false)?;

        let mut filter = parent_filter.clone();
        filter.include.extend(parsed.filter.include);
        filter.exclude.extend(parsed.filter.exclude);
        filter.listing = parsed.filter.listing;

        let real_path = match parsed.components.first() {
            Some(component) => parent_real.join(component),
            None => parent_real.to_path_buf(),
        };
        Ok((real_path, filter))
    }

    fn build_parsed(&self, real_path: &Path, filter: Filter) -> crate::error::Result<ParsedPath> {
        let components = real_components(real_path);
        let joined = components.join("/");
        let mut parsed = parse_path(&format!("/{joined}"), &self.config, false)?;
        parsed.filter = filter;
        Ok(parsed)
    }

    /// `visible(...)` with the POSIX-layer carve-out from spec §7: a
    /// directory is always traversable even when the filter would hide
    /// it, so only files turn an invisible result into `Hidden`.
    fn check_visible(&self, parent_real: &Path, parent_filter: &Filter, name: &str, is_dir: bool) -> crate::error::Result<()> {
        if is_dir {
            return Ok(());
        }
        let store = MetadataStore::open_read(&self.abs(parent_real))?;
        let parent_id = match &store {
            Some(s) => s.root_id()?,
            None => 0,
        };
        if filter::visible(store.as_ref(), parent_filter, parent_id, name)? {
            Ok(())
        } else {
            Err(Error::hidden(name))
        }
    }

    fn lookup_inner(&self, parent: u64, name: &OsStr) -> crate::error::Result<(u64, FileAttr)> {
        let (parent_real, parent_filter) = {
            let inodes = self.inodes.lock().unwrap();
            inodes
                .get(parent)
                .ok_or_else(|| Error::internal(format!("lookup: unknown inode {parent}")))?
        };

        let (real_path, filter) = self.resolve(&parent_real, &parent_filter, name)?;
        let is_tag_segment = real_path == parent_real;
        let abs = self.abs(&real_path);
        let meta = fs::symlink_metadata(&abs)?;
        let is_dir = meta.is_dir();

        if !is_tag_segment && !filter.listing {
            if let Some(name_str) = name.to_str() {
                self.check_visible(&parent_real, &parent_filter, name_str, is_dir)?;
            }
        }

        let ino = {
            let mut inodes = self.inodes.lock().unwrap();
            inodes.intern(real_path, filter)
        };
        let mut attr = attr_from_metadata(ino, &meta);
        attr.ino = ino;
        Ok((ino, attr))
    }

}

impl Filesystem for BeholdFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_inner(parent, name) {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => {
                trace!(error = %e, ?name, "lookup failed");
                reply.error(errno_for(&e));
            }
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.lock().unwrap().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let (real_path, filter) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("getattr: unknown inode {ino}"))),
            reply
        );
        if filter.listing {
            reply.attr(&TTL, &synthetic_tag_attr(ino));
            return;
        }
        let meta = try_reply!(fs::symlink_metadata(self.abs(&real_path)).map_err(Error::from), reply);
        reply.attr(&TTL, &attr_from_metadata(ino, &meta));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("readlink: unknown inode {ino}"))),
            reply
        );
        let target = try_reply!(fs::read_link(self.abs(&real_path)).map_err(Error::from), reply);
        reply.data(target.to_string_lossy().as_bytes());
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.make_entry(parent, name, ObjectKind::File, mode, reply);
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        self.make_entry(parent, name, ObjectKind::Directory, mode | libc::S_IFDIR, reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = (|| -> crate::error::Result<(u64, FileAttr, u64)> {
            let (parent_real, parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(parent)
                    .ok_or_else(|| Error::internal(format!("create: unknown inode {parent}")))?
            };
            let (real_path, filter) = self.resolve(&parent_real, &parent_filter, name)?;
            let abs = self.abs(&real_path);
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&abs)?;
            fs::set_permissions(&abs, std::os::unix::fs::PermissionsExt::from_mode(mode & 0o7777)).ok();

            let parsed = self.build_parsed(&real_path, filter.clone())?;
            if let Err(e) = mutate::create(&self.fsroot, &parsed, ObjectKind::File) {
                let _ = fs::remove_file(&abs);
                return Err(e);
            }

            let meta = fs::symlink_metadata(&abs)?;
            let ino = self.inodes.lock().unwrap().intern(real_path, filter);
            let fh = self.alloc_fh();
            self.files.lock().unwrap().insert(fh, file);
            Ok((ino, attr_from_metadata(ino, &meta), fh))
        })();

        match result {
            Ok((_, attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, ObjectKind::File, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, ObjectKind::Directory, reply);
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let result = (|| -> crate::error::Result<(u64, FileAttr)> {
            let (parent_real, parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(parent)
                    .ok_or_else(|| Error::internal(format!("symlink: unknown inode {parent}")))?
            };
            let (real_path, filter) = self.resolve(&parent_real, &parent_filter, link_name)?;
            let abs = self.abs(&real_path);
            std::os::unix::fs::symlink(target, &abs)?;

            let parsed = self.build_parsed(&real_path, filter.clone())?;
            if let Err(e) = mutate::create(&self.fsroot, &parsed, ObjectKind::File) {
                let _ = fs::remove_file(&abs);
                return Err(e);
            }
            let meta = fs::symlink_metadata(&abs)?;
            let ino = self.inodes.lock().unwrap().intern(real_path, filter);
            Ok((ino, attr_from_metadata(ino, &meta)))
        })();

        match result {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let result = (|| -> crate::error::Result<(u64, FileAttr)> {
            let (target_real, _) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(ino)
                    .ok_or_else(|| Error::internal(format!("link: unknown inode {ino}")))?
            };
            let (parent_real, parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(newparent)
                    .ok_or_else(|| Error::internal(format!("link: unknown inode {newparent}")))?
            };
            let (real_path, filter) = self.resolve(&parent_real, &parent_filter, newname)?;
            fs::hard_link(self.abs(&target_real), self.abs(&real_path))?;

            let parsed = self.build_parsed(&real_path, filter.clone())?;
            mutate::create(&self.fsroot, &parsed, ObjectKind::File)?;
            let meta = fs::symlink_metadata(self.abs(&real_path))?;
            let new_ino = self.inodes.lock().unwrap().intern(real_path, filter);
            Ok((new_ino, attr_from_metadata(new_ino, &meta)))
        })();

        match result {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> crate::error::Result<()> {
            let (old_parent_real, old_parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(parent)
                    .ok_or_else(|| Error::internal(format!("rename: unknown inode {parent}")))?
            };
            let (new_parent_real, new_parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(newparent)
                    .ok_or_else(|| Error::internal(format!("rename: unknown inode {newparent}")))?
            };
            let (old_real, old_filter) = self.resolve(&old_parent_real, &old_parent_filter, name)?;
            let (new_real, new_filter) = self.resolve(&new_parent_real, &new_parent_filter, newname)?;
            let meta = fs::symlink_metadata(self.abs(&old_real))?;
            let kind = if meta.is_dir() { ObjectKind::Directory } else { ObjectKind::File };

            fs::rename(self.abs(&old_real), self.abs(&new_real))?;

            let old_parsed = self.build_parsed(&old_real, old_filter)?;
            let new_parsed = self.build_parsed(&new_real, new_filter)?;
            mutate::rename(&self.fsroot, &old_parsed, &new_parsed, kind)?;

            self.inodes.lock().unwrap().invalidate(&old_real);
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("open: unknown inode {ino}"))),
            reply
        );
        let mut opts = fs::OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                opts.write(true);
            }
            libc::O_RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        let file = try_reply!(opts.open(self.abs(&real_path)).map_err(Error::from), reply);
        let fh = self.alloc_fh();
        self.files.lock().unwrap().insert(fh, file);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        use std::io::{Read, Seek, SeekFrom};
        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let read = (|| -> std::io::Result<usize> {
            file.seek(SeekFrom::Start(offset as u64))?;
            file.read(&mut buf)
        })();
        match read {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                warn!(error = %e, "read failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        use std::io::{Seek, SeekFrom, Write};
        let mut files = self.files.lock().unwrap();
        let Some(file) = files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let written = (|| -> std::io::Result<usize> {
            file.seek(SeekFrom::Start(offset as u64))?;
            file.write(data)
        })();
        match written {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                warn!(error = %e, "write failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if let Some(file) = self.files.lock().unwrap().get(&fh) {
            let _ = file.sync_data();
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.files.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        if let Some(file) = self.files.lock().unwrap().get(&fh) {
            let result = if datasync { file.sync_data() } else { file.sync_all() };
            if let Err(e) = result {
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let (real_path, filter) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("opendir: unknown inode {ino}"))),
            reply
        );
        let session = try_reply!(Session::open(&self.abs(&real_path), &filter, &self.config), reply);
        let fh = self.alloc_fh();
        self.dirs.lock().unwrap().insert(fh, session);
        reply.opened(fh, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dirs = self.dirs.lock().unwrap();
        let Some(session) = dirs.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let entries = session.entries();
        let start = offset as usize;
        for (i, entry) in entries.iter().enumerate().skip(start) {
            let kind = match entry.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
                EntryKind::File => FileType::RegularFile,
                EntryKind::Other => FileType::RegularFile,
            };
            // `offset` passed back is the index of the *next* entry, so
            // a later call starting there (including a restart at 0)
            // replays the same buffered listing (spec §4.7).
            if reply.add(1, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dirs.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("getxattr: unknown inode {ino}"))),
            reply
        );
        let abs = self.abs(&real_path);

        let value = if name == XATTR_TAGS {
            try_reply!(self.tags_xattr_value(&abs), reply)
        } else {
            match xattr::get(&abs, name) {
                Ok(Some(v)) => v,
                Ok(None) => {
                    reply.error(libc::ENODATA);
                    return;
                }
                Err(e) => {
                    reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                    return;
                }
            }
        };

        if size == 0 {
            reply.size(value.len() as u32);
        } else if (value.len() as u32) > size {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&value);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("setxattr: unknown inode {ino}"))),
            reply
        );
        let abs = self.abs(&real_path);

        if name == XATTR_TAGS {
            let tags = try_reply!(self.parse_tags_value(value), reply);
            let kind = try_reply!(object_kind_of(&abs), reply);
            let parsed = try_reply!(self.build_parsed(&real_path, Filter::default()), reply);
            try_reply!(mutate::retag(&self.fsroot, &parsed, kind, &tags), reply);
        } else {
            try_reply!(xattr::set(&abs, name, value).map_err(Error::Io), reply);
        }
        reply.ok();
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("listxattr: unknown inode {ino}"))),
            reply
        );
        let abs = self.abs(&real_path);
        let mut buf = Vec::new();
        if let Ok(list) = xattr::list(&abs) {
            for name in list {
                buf.extend_from_slice(name.to_string_lossy().as_bytes());
                buf.push(0);
            }
        }
        buf.extend_from_slice(XATTR_TAGS.as_bytes());
        buf.push(0);

        if size == 0 {
            reply.size(buf.len() as u32);
        } else if (buf.len() as u32) > size {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&buf);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (real_path, _) = try_reply!(
            self.inodes
                .lock()
                .unwrap()
                .get(ino)
                .ok_or_else(|| Error::internal(format!("removexattr: unknown inode {ino}"))),
            reply
        );
        if name == XATTR_TAGS {
            let kind = try_reply!(object_kind_of(&self.abs(&real_path)), reply);
            let parsed = try_reply!(self.build_parsed(&real_path, Filter::default()), reply);
            try_reply!(mutate::retag(&self.fsroot, &parsed, kind, &[]), reply);
            reply.ok();
            return;
        }
        match xattr::remove(self.abs(&real_path), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

impl BeholdFs {
    fn make_entry(&mut self, parent: u64, name: &OsStr, kind: ObjectKind, mode: u32, reply: ReplyEntry) {
        let result = (|| -> crate::error::Result<(u64, FileAttr)> {
            let (parent_real, parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(parent)
                    .ok_or_else(|| Error::internal(format!("create entry: unknown inode {parent}")))?
            };
            let (real_path, filter) = self.resolve(&parent_real, &parent_filter, name)?;
            let abs = self.abs(&real_path);

            match kind {
                ObjectKind::Directory => fs::create_dir(&abs)?,
                _ => {
                    fs::OpenOptions::new().write(true).create_new(true).open(&abs)?;
                }
            }
            let perm_result = fs::set_permissions(&abs, std::os::unix::fs::PermissionsExt::from_mode(mode & 0o7777));
            if let Err(e) = perm_result {
                warn!(error = %e, "failed to apply requested mode bits");
            }

            let parsed = self.build_parsed(&real_path, filter.clone())?;
            if let Err(e) = mutate::create(&self.fsroot, &parsed, kind) {
                let _ = match kind {
                    ObjectKind::Directory => fs::remove_dir(&abs),
                    _ => fs::remove_file(&abs),
                };
                return Err(e);
            }

            let meta = fs::symlink_metadata(&abs)?;
            let ino = self.inodes.lock().unwrap().intern(real_path, filter);
            Ok((ino, attr_from_metadata(ino, &meta)))
        })();

        match result {
            Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn remove_entry(&mut self, parent: u64, name: &OsStr, kind: ObjectKind, reply: ReplyEmpty) {
        let result = (|| -> crate::error::Result<PathBuf> {
            let (parent_real, parent_filter) = {
                let inodes = self.inodes.lock().unwrap();
                inodes
                    .get(parent)
                    .ok_or_else(|| Error::internal(format!("remove entry: unknown inode {parent}")))?
            };
            let (real_path, filter) = self.resolve(&parent_real, &parent_filter, name)?;
            let abs = self.abs(&real_path);
            match kind {
                ObjectKind::Directory => fs::remove_dir(&abs)?,
                _ => fs::remove_file(&abs)?,
            }
            let parsed = self.build_parsed(&real_path, filter)?;
            mutate::delete(&self.fsroot, &parsed, kind).or_else(|e| {
                // The backing unlink/rmdir already succeeded; an object
                // the metadata store never tracked is expected and
                // harmless (spec's own phrasing, `mutate::delete`).
                if matches!(e, Error::NotFound { .. }) {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
            Ok(real_path)
        })();

        match result {
            Ok(real_path) => {
                self.inodes.lock().unwrap().invalidate(&real_path);
                reply.ok();
            }
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn tags_xattr_value(&self, abs: &Path) -> crate::error::Result<Vec<u8>> {
        let dir = abs.parent().unwrap_or_else(|| Path::new("."));
        let name = abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::internal("getxattr: non-utf8 file name"))?;
        let kind = object_kind_of(abs)?;
        let store = MetadataStore::open_read(dir)?.ok_or_else(|| Error::not_found(name))?;
        let parent_id = store.root_id()?;
        let object_id = store
            .find_object(parent_id, kind, name)?
            .ok_or_else(|| Error::not_found(name))?;
        let names = store.object_tag_names(object_id)?;
        let mut out = String::new();
        for tag in names {
            out.push(self.config.tag_sigil as char);
            out.push_str(&tag);
        }
        Ok(out.into_bytes())
    }

    fn parse_tags_value(&self, value: &[u8]) -> crate::error::Result<Vec<String>> {
        let text = std::str::from_utf8(value).map_err(|_| Error::malformed_path("xattr value is not utf-8"))?;
        Ok(text
            .split(self.config.tag_sigil as char)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect())
    }
}
