//! Read-only snapshot filesystem.
//!
//! `SnapshotFs` exposes the tree of a host directory, captured once when
//! the filesystem is built, through FUSE. File contents are read from the
//! host on demand; every mutating request is refused with `EROFS`.

use super::constants::{BLOCK_SIZE, INITIAL_INODE, ROOT_INODE, TTL};
use anyhow::{anyhow, Result};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EISDIR, ENOENT, ENOTDIR, EROFS};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone)]
struct Entry {
    name: OsString,
    host: PathBuf,
    attr: FileAttr,
    children: Vec<u64>,
}

#[derive(Debug)]
struct Snapshot {
    source: PathBuf,
    entries: HashMap<u64, Entry>,
}

/// A read-only view of a host directory.
#[derive(Debug, Clone)]
pub struct SnapshotFs {
    inner: Arc<Snapshot>,
}

impl SnapshotFs {
    /// Captures the tree below `source`.
    pub fn new(source: impl AsRef<Path>) -> Result<Self> {
        let source = fs::canonicalize(source.as_ref())?;
        let root_meta = fs::metadata(&source)?;
        if !root_meta.is_dir() {
            return Err(anyhow!("Snapshot source is not a directory: {:?}", source));
        }

        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INODE,
            Entry {
                name: OsString::from("."),
                host: source.clone(),
                attr: file_attr(ROOT_INODE, &root_meta),
                children: Vec::new(),
            },
        );

        let mut next_inode = INITIAL_INODE;
        let mut queue = VecDeque::new();
        queue.push_back((source.clone(), ROOT_INODE));

        while let Some((dir, parent)) = queue.pop_front() {
            for dir_entry in fs::read_dir(&dir)? {
                let dir_entry = dir_entry?;
                let meta = fs::symlink_metadata(dir_entry.path())?;
                if !meta.is_dir() && !meta.is_file() {
                    trace!("Skipping special file {:?}", dir_entry.path());
                    continue;
                }

                let inode = next_inode;
                next_inode += 1;

                if meta.is_dir() {
                    queue.push_back((dir_entry.path(), inode));
                }
                entries.insert(
                    inode,
                    Entry {
                        name: dir_entry.file_name(),
                        host: dir_entry.path(),
                        attr: file_attr(inode, &meta),
                        children: Vec::new(),
                    },
                );
                if let Some(parent) = entries.get_mut(&parent) {
                    parent.children.push(inode);
                }
            }
        }

        debug!("Captured {} entries from {:?}", entries.len(), source);
        Ok(Self {
            inner: Arc::new(Snapshot { source, entries }),
        })
    }

    /// The host directory the snapshot was taken from.
    pub fn source(&self) -> &Path {
        &self.inner.source
    }

    /// Number of entries, the root included.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the snapshot holds only its root.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Resolves a path relative to the snapshot root to its inode.
    pub fn resolve(&self, relative: &Path) -> Option<u64> {
        relative
            .components()
            .try_fold(ROOT_INODE, |ino, part| self.child(ino, part.as_os_str()).map(|e| e.attr.ino))
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<&Entry> {
        let parent = self.inner.entries.get(&parent)?;
        parent
            .children
            .iter()
            .filter_map(|ino| self.inner.entries.get(ino))
            .find(|entry| entry.name == name)
    }

    fn read_range(&self, ino: u64, offset: i64, size: u32) -> io::Result<Vec<u8>> {
        let entry = self
            .inner
            .entries
            .get(&ino)
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))?;
        if entry.attr.kind == FileType::Directory {
            return Err(io::Error::from_raw_os_error(EISDIR));
        }

        let offset = u64::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let len = entry.attr.size.saturating_sub(offset).min(u64::from(size));
        let mut buf = vec![0; len as usize];
        let read = File::open(&entry.host)?.read_at(&mut buf, offset)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn dir_entries(&self, ino: u64) -> io::Result<Vec<(u64, FileType, OsString)>> {
        let entry = self
            .inner
            .entries
            .get(&ino)
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))?;
        if entry.attr.kind != FileType::Directory {
            return Err(io::Error::from_raw_os_error(ENOTDIR));
        }

        let parent = self
            .inner
            .entries
            .iter()
            .find(|(_, e)| e.children.contains(&ino))
            .map_or(ROOT_INODE, |(parent, _)| *parent);

        let mut listing = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent, FileType::Directory, OsString::from("..")),
        ];
        for child in entry.children.iter().filter_map(|c| self.inner.entries.get(c)) {
            listing.push((child.attr.ino, child.attr.kind, child.name.clone()));
        }
        Ok(listing)
    }
}

fn file_attr(inode: u64, metadata: &fs::Metadata) -> FileAttr {
    let size = if metadata.is_dir() { 0 } else { metadata.len() };
    FileAttr {
        ino: inode,
        size,
        blocks: (size + BLOCK_SIZE - 1) / BLOCK_SIZE,
        atime: metadata.accessed().unwrap_or(UNIX_EPOCH),
        mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
        ctime: metadata.modified().unwrap_or(UNIX_EPOCH),
        crtime: metadata.created().unwrap_or(UNIX_EPOCH),
        kind: if metadata.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: (metadata.mode() & 0o555) as u16,
        nlink: if metadata.is_dir() { 2 } else { 1 },
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE as u32,
    }
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

impl Filesystem for SnapshotFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child(parent, name) {
            Some(entry) => reply.entry(&TTL, &entry.attr, 0),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.inner.entries.get(&ino) {
            Some(entry) => reply.attr(&TTL, &entry.attr),
            None => reply.error(ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if !self.inner.entries.contains_key(&ino) {
            reply.error(ENOENT);
        } else if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(EROFS);
        } else {
            reply.opened(0, 0);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_range(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.dir_entries(ino) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        for (i, (inode, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            if reply.add(inode, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(EROFS);
    }
}
