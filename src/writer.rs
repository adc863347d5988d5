//! The archive writer: admission state machine, regular-file encoding
//! strategies, streaming entries with deferred header backpatching, and
//! finalization.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::format::{
    build_header, Block, Entry, EntryKind, Format, Ownership, BLOCK_SIZE, ZERO_BLOCK,
};
use crate::fs::{clean_path, path_to_name, FileId, Host, NameCache, UnixHost};
use crate::lz4_encoder::Lz4Encoder;
use crate::sink::Sink;
use crate::util::read_full;

/// Compression applied to the archive byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Raw tar bytes.
    #[default]
    None,
    /// The whole tar stream wrapped in a single LZ4 frame.
    Lz4,
}

/// Construction options for a [`TarWriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    pub format: Format,
    pub compression: Compression,
}

/// Writes one tar archive to a file or a block callback.
///
/// All admission methods must be called from one logical owner, serialized;
/// there is no internal synchronization. Entries appear in the archive in
/// the order the calls complete. Dropping the writer finalizes the archive
/// and swallows errors; call [`close`](Self::close) explicitly to see them.
pub struct TarWriter<H: Host = UnixHost> {
    host: H,
    format: Format,
    compression: Compression,
    sink: Sink,
    lz4: Option<Lz4Encoder>,
    /// Canonical path of the archive's own output file (File mode), used to
    /// refuse archiving the archive into itself.
    own_path: Option<PathBuf>,
    /// Sink offset of the placeholder header while a streaming entry is in
    /// progress; `Some` is what makes every other admission call illegal.
    stream_header_pos: Option<u64>,
    /// Sub-block data carried between `stream_data` calls, always < 512.
    stream_buf: Vec<u8>,
    /// Inode identity → archive name of the regular file first stored for
    /// it; a second path to the same inode is demoted to a hard link.
    inode_map: HashMap<FileId, String>,
    /// Archive names already written as regular files.
    name_set: HashSet<String>,
    names: NameCache,
    closed: bool,
}

impl std::fmt::Debug for TarWriter<UnixHost> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarWriter")
            .field("format", &self.format)
            .field("compression", &self.compression)
            .field("sink", &self.sink)
            .field("streaming", &self.stream_header_pos.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn validate_target(name: &str, kind: EntryKind) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("empty target path"));
    }
    if name.split('/').any(|seg| seg == "..") {
        return Err(Error::invalid(format!(
            "target path contains '..' components: {name:?}"
        )));
    }
    if name.ends_with('/') && kind != EntryKind::Directory {
        return Err(Error::invalid(format!(
            "trailing '/' on a non-directory target: {name:?}"
        )));
    }
    Ok(())
}

impl TarWriter<UnixHost> {
    /// Creates a writer emitting the archive to a file at `path`.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        Self::create_with_host(UnixHost, path, options)
    }

    /// Creates a writer handing every finished 512-byte block to `emit`,
    /// suitable for piping to a socket or stdout. The callback must not
    /// call back into this writer.
    pub fn with_callback(emit: impl FnMut(&Block, usize) + 'static, options: WriterOptions) -> Self {
        Self::callback_with_host(UnixHost, emit, options)
    }
}

impl<H: Host> TarWriter<H> {
    /// Like [`TarWriter::create`], over a caller-supplied host.
    pub fn create_with_host(host: H, path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref();
        let sink = Sink::file(path)?;
        // the file exists now, so this only fails for exotic reasons
        let own_path = host.realpath(path).ok();
        Ok(Self::new(host, sink, own_path, options))
    }

    /// Like [`TarWriter::with_callback`], over a caller-supplied host.
    pub fn callback_with_host(
        host: H,
        emit: impl FnMut(&Block, usize) + 'static,
        options: WriterOptions,
    ) -> Self {
        Self::new(host, Sink::callback(emit), None, options)
    }

    fn new(host: H, sink: Sink, own_path: Option<PathBuf>, options: WriterOptions) -> Self {
        let lz4 = match options.compression {
            Compression::None => None,
            Compression::Lz4 => Some(Lz4Encoder::new()),
        };
        Self {
            host,
            format: options.format,
            compression: options.compression,
            sink,
            lz4,
            own_path,
            stream_header_pos: None,
            stream_buf: Vec::new(),
            inode_map: HashMap::new(),
            name_set: HashSet::new(),
            names: NameCache::default(),
            closed: false,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Whether the writer still accepts entries.
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::IllegalState("writer is closed"));
        }
        Ok(())
    }

    fn ensure_admissible(&self) -> Result<()> {
        self.ensure_open()?;
        if self.stream_header_pos.is_some() {
            return Err(Error::IllegalState(
                "a streaming entry is in progress; complete it first",
            ));
        }
        Ok(())
    }

    /// Pushes one block through the compression stage (if any) into the
    /// sink. Header blocks are stored uncompressed in the frame and flushed
    /// immediately so their offset stays identifiable for backpatching.
    fn write_block(&mut self, block: &Block, is_header: bool) -> Result<()> {
        match &mut self.lz4 {
            Some(enc) => {
                if is_header {
                    enc.uncompressed_update(block)?;
                    enc.flush()?;
                } else {
                    enc.compress_update(block)?;
                }
                let out = enc.take_output();
                self.sink.write(&out)
            }
            None => self.sink.write(block),
        }
    }

    /// Drains pending compressed data so the emitted-byte counter and the
    /// sink position agree. Required before sampling `tell`.
    fn flush_stage(&mut self) -> Result<()> {
        if let Some(enc) = &mut self.lz4 {
            enc.flush()?;
            let out = enc.take_output();
            self.sink.write(&out)?;
        }
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        match &self.lz4 {
            Some(enc) => Ok(enc.position()),
            None => self.sink.tell(),
        }
    }

    fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.sink.seek(pos)?;
        if let Some(enc) = &mut self.lz4 {
            enc.seek(pos);
        }
        Ok(())
    }

    /// Resolves the ustar owner/group names through the per-writer cache.
    fn ownership(&mut self, uid: u32, gid: u32) -> Result<(String, String)> {
        if self.format != Format::Ustar {
            return Ok((String::new(), String::new()));
        }
        let user = self.names.user_name(&self.host, uid)?;
        let group = self.names.group_name(&self.host, gid)?;
        Ok((user, group))
    }

    /// Encodes and writes an entry that carries no data blocks.
    fn admit(&mut self, entry: &Entry) -> Result<()> {
        let (user, group) = self.ownership(entry.uid, entry.gid)?;
        let header = build_header(
            entry,
            self.format,
            &Ownership {
                user: &user,
                group: &group,
            },
        )?;
        self.write_block(&header, true)?;
        debug!("added {:?} entry {:?}", entry.kind, entry.name);
        Ok(())
    }

    /// Adds the filesystem object at `src` under its own (normalized) name.
    pub fn add_from_path(&mut self, src: impl AsRef<Path>) -> Result<()> {
        let src = src.as_ref();
        self.add_from_path_as(src, src, false)
    }

    /// Adds the filesystem object at `src` under the archive name derived
    /// from `dst`. With `follow_symlinks`, a symlink source is archived
    /// with its target's kind and metadata but keeps the `dst` name.
    pub fn add_from_path_as(
        &mut self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        follow_symlinks: bool,
    ) -> Result<()> {
        self.ensure_admissible()?;
        self.add_path_entry(src.as_ref(), dst.as_ref(), follow_symlinks, false)
    }

    /// Adds `src` and, if it is a directory, all of its descendants in
    /// deterministic pre-order.
    pub fn add_from_path_recursive(&mut self, src: impl AsRef<Path>) -> Result<()> {
        let src = src.as_ref();
        self.add_from_path_recursive_as(src, src, false)
    }

    /// Recursive variant of [`add_from_path_as`](Self::add_from_path_as):
    /// each visited path is admitted with its `src` prefix rewritten to
    /// `dst`. Kinds the format cannot express are skipped; read errors
    /// abort the call, leaving already-written entries in the archive.
    pub fn add_from_path_recursive_as(
        &mut self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        follow_symlinks: bool,
    ) -> Result<()> {
        self.ensure_admissible()?;
        let (src, dst) = (src.as_ref(), dst.as_ref());
        if self.host.kind(src)? != EntryKind::Directory {
            return self.add_path_entry(src, dst, follow_symlinks, false);
        }
        self.walk_into(src, dst, follow_symlinks)
    }

    /// Pre-order descent replaying each visited path through admission.
    fn walk_into(&mut self, src: &Path, dst: &Path, follow: bool) -> Result<()> {
        self.add_path_entry(src, dst, follow, true)?;
        if matches!(self.host.kind(src), Ok(EntryKind::Directory)) {
            for name in self.host.read_dir_sorted(src)? {
                self.walk_into(&src.join(&name), &dst.join(&name), follow)?;
            }
        }
        Ok(())
    }

    fn add_path_entry(
        &mut self,
        src: &Path,
        dst: &Path,
        follow: bool,
        during_walk: bool,
    ) -> Result<()> {
        if !self.host.exists(src) {
            return Err(Error::NotFound(src.to_owned()));
        }
        if let Some(own) = &self.own_path {
            if self.host.realpath(src).ok().as_deref() == Some(own.as_path()) {
                return Err(Error::invalid("archive cannot contain its own output file"));
            }
        }

        let mut kind = match self.host.kind(src) {
            Ok(kind) => kind,
            // sockets and unknown objects are skipped on walks
            Err(Error::Unsupported(msg)) if during_walk => {
                debug!("skipping {src:?}: {msg}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // metadata source; a followed symlink contributes its target's
        let mut meta = src.to_owned();
        if follow && kind == EntryKind::Symlink {
            meta = self.host.realpath(src)?;
            kind = self.host.kind(&meta)?;
        }

        if !self.format.supports(kind) {
            if during_walk {
                debug!(
                    "skipping {src:?}: {kind:?} not representable in {:?}",
                    self.format
                );
                return Ok(());
            }
            return Err(Error::unsupported(format!(
                "{kind:?} entries cannot be represented in {:?} archives",
                self.format
            )));
        }

        let name = clean_path(path_to_name(dst)?)?;
        validate_target(&name, kind)?;

        let mut entry = Entry::new(name, kind);
        entry.mode = self.host.mode(&meta)?;
        entry.uid = self.host.file_owner(&meta)?;
        entry.gid = self.host.file_group(&meta)?;
        entry.mtime = self.host.mtime(&meta)?;

        match kind {
            EntryKind::Regular => {
                let id = self.host.inode(&meta)?;
                if let Some(stored) = self.inode_map.get(&id) {
                    // second path to the same storage object
                    entry.kind = EntryKind::Hardlink;
                    entry.link_name = stored.clone();
                    return self.admit(&entry);
                }
                if self.name_set.contains(&entry.name) {
                    return Err(Error::IllegalState("duplicate regular-file name"));
                }

                entry.size = self.host.size(&meta)?;
                let mut file = File::open(&meta)?;
                if self.sink.is_file() && self.lz4.is_none() {
                    self.write_regular_dynamic(&mut file, &mut entry)?;
                } else {
                    let (user, group) = self.ownership(entry.uid, entry.gid)?;
                    let header = build_header(
                        &entry,
                        self.format,
                        &Ownership {
                            user: &user,
                            group: &group,
                        },
                    )?;
                    self.write_regular_const(&mut file, &header, entry.size)?;
                }
                self.inode_map.insert(id, entry.name.clone());
                self.name_set.insert(entry.name.clone());
                debug!("added regular file {:?} ({} bytes)", entry.name, entry.size);
                Ok(())
            }
            EntryKind::Symlink => {
                let target = self.host.read_symlink(src)?;
                entry.link_name = path_to_name(&target)?.to_string();
                self.admit(&entry)
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                let (major, minor) = self.host.major_minor(&meta)?;
                entry.dev_major = major;
                entry.dev_minor = minor;
                self.admit(&entry)
            }
            _ => self.admit(&entry),
        }
    }

    /// Const-size strategy: the header goes first with the size recorded up
    /// front, then exactly `ceil(size / 512)` data blocks follow. A source
    /// that shrinks mid-read is zero-padded to the declared size; one that
    /// grows is cut at it. Header and payload can never disagree.
    fn write_regular_const(&mut self, file: &mut File, header: &Block, size: u64) -> Result<()> {
        self.write_block(header, true)?;
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(BLOCK_SIZE as u64) as usize;
            let mut block = ZERO_BLOCK;
            read_full(file, &mut block[..want])?;
            self.write_block(&block, false)?;
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Dynamic-size strategy (uncompressed file output only): placeholder
    /// header, stream to EOF counting actual bytes, then seek back and
    /// write the header with the observed size.
    fn write_regular_dynamic(&mut self, file: &mut File, entry: &mut Entry) -> Result<()> {
        let (user, group) = self.ownership(entry.uid, entry.gid)?;
        let owner = Ownership {
            user: &user,
            group: &group,
        };
        // an unencodable entry must fail before anything hits the sink
        build_header(entry, self.format, &owner)?;

        let header_pos = self.tell()?;
        self.write_block(&ZERO_BLOCK, true)?;

        let mut total: u64 = 0;
        loop {
            let mut block = ZERO_BLOCK;
            let got = read_full(file, &mut block)?;
            if got == 0 {
                break;
            }
            total += got as u64;
            self.write_block(&block, false)?;
            if got < BLOCK_SIZE {
                break;
            }
        }

        let end = self.tell()?;
        entry.size = total;
        let header = build_header(entry, self.format, &owner)?;
        self.seek_to(header_pos)?;
        self.write_block(&header, true)?;
        self.seek_to(end)
    }

    /// Admits a directory entry composed from the arguments, without
    /// consulting the filesystem.
    pub fn add_directory(
        &mut self,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> Result<()> {
        self.ensure_admissible()?;
        let name = clean_path(name)?;
        validate_target(&name, EntryKind::Directory)?;
        let mut entry = Entry::new(name, EntryKind::Directory);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        self.admit(&entry)
    }

    /// Admits a symbolic link entry pointing at `target`.
    pub fn add_symlink(
        &mut self,
        name: &str,
        target: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> Result<()> {
        self.ensure_admissible()?;
        let name = clean_path(name)?;
        validate_target(&name, EntryKind::Symlink)?;
        let mut entry = Entry::new(name, EntryKind::Symlink);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        entry.link_name = target.to_string();
        self.admit(&entry)
    }

    /// Admits a hard link entry pointing at the archive name `target`.
    pub fn add_hardlink(
        &mut self,
        name: &str,
        target: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> Result<()> {
        self.ensure_admissible()?;
        let name = clean_path(name)?;
        validate_target(&name, EntryKind::Hardlink)?;
        let mut entry = Entry::new(name, EntryKind::Hardlink);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        entry.link_name = target.to_string();
        self.admit(&entry)
    }

    /// Admits a FIFO entry (ustar only).
    pub fn add_fifo(&mut self, name: &str, mode: u32, uid: u32, gid: u32, mtime: i64) -> Result<()> {
        self.ensure_admissible()?;
        let name = clean_path(name)?;
        validate_target(&name, EntryKind::Fifo)?;
        let mut entry = Entry::new(name, EntryKind::Fifo);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        self.admit(&entry)
    }

    /// Admits a character-special entry (ustar only).
    #[allow(clippy::too_many_arguments)]
    pub fn add_character_device(
        &mut self,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.add_device(EntryKind::CharDevice, name, mode, uid, gid, mtime, major, minor)
    }

    /// Admits a block-special entry (ustar only).
    #[allow(clippy::too_many_arguments)]
    pub fn add_block_device(
        &mut self,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.add_device(EntryKind::BlockDevice, name, mode, uid, gid, mtime, major, minor)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_device(
        &mut self,
        kind: EntryKind,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.ensure_admissible()?;
        let name = clean_path(name)?;
        validate_target(&name, kind)?;
        let mut entry = Entry::new(name, kind);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        entry.dev_major = major;
        entry.dev_minor = minor;
        self.admit(&entry)
    }

    /// Starts a streaming regular-file entry whose size is not yet known.
    ///
    /// File output only: the placeholder header written here is rewritten
    /// by [`stream_complete`](Self::stream_complete), which needs to seek.
    pub fn stream_begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.stream_header_pos.is_some() {
            return Err(Error::IllegalState("a streaming entry is already in progress"));
        }
        if !self.sink.is_file() {
            return Err(Error::IllegalState(
                "streaming entries require seekable file output",
            ));
        }
        // flush so the snapshot below is the exact header offset
        self.flush_stage()?;
        let pos = self.tell()?;
        self.write_block(&ZERO_BLOCK, true)?;
        self.stream_header_pos = Some(pos);
        Ok(())
    }

    /// Appends payload bytes to the streaming entry, emitting full blocks
    /// as they accumulate and carrying any sub-block remainder.
    pub fn stream_data(&mut self, mut data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.stream_header_pos.is_none() {
            return Err(Error::IllegalState("no streaming entry in progress"));
        }

        let mut block = ZERO_BLOCK;
        if !self.stream_buf.is_empty() && self.stream_buf.len() + data.len() >= BLOCK_SIZE {
            let take = BLOCK_SIZE - self.stream_buf.len();
            block[..self.stream_buf.len()].copy_from_slice(&self.stream_buf);
            block[self.stream_buf.len()..].copy_from_slice(&data[..take]);
            self.stream_buf.clear();
            self.write_block(&block, false)?;
            data = &data[take..];
        }
        while data.len() >= BLOCK_SIZE {
            block.copy_from_slice(&data[..BLOCK_SIZE]);
            self.write_block(&block, false)?;
            data = &data[BLOCK_SIZE..];
        }
        self.stream_buf.extend_from_slice(data);
        Ok(())
    }

    /// Finishes the streaming entry: pads out the final block, then seeks
    /// back and replaces the placeholder with the real header built from
    /// the supplied attributes. The declared `size` goes into the header
    /// verbatim.
    pub fn stream_complete(
        &mut self,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        mtime: i64,
    ) -> Result<()> {
        self.ensure_open()?;
        let header_pos = self
            .stream_header_pos
            .ok_or(Error::IllegalState("no streaming entry in progress"))?;

        let name = clean_path(name)?;
        validate_target(&name, EntryKind::Regular)?;
        if self.name_set.contains(&name) {
            return Err(Error::IllegalState("duplicate regular-file name"));
        }

        if !self.stream_buf.is_empty() {
            let mut block = ZERO_BLOCK;
            block[..self.stream_buf.len()].copy_from_slice(&self.stream_buf);
            self.stream_buf.clear();
            self.write_block(&block, false)?;
        }
        self.flush_stage()?;
        let end = self.tell()?;

        let mut entry = Entry::new(name, EntryKind::Regular);
        entry.mode = mode;
        entry.uid = uid;
        entry.gid = gid;
        entry.size = size;
        entry.mtime = mtime;
        let (user, group) = self.ownership(uid, gid)?;
        let header = build_header(
            &entry,
            self.format,
            &Ownership {
                user: &user,
                group: &group,
            },
        )?;

        self.seek_to(header_pos)?;
        self.write_block(&header, true)?;
        self.seek_to(end)?;

        debug!("completed streamed file {:?} ({size} bytes)", entry.name);
        self.name_set.insert(entry.name);
        self.stream_header_pos = None;
        Ok(())
    }

    /// Finalizes the archive: two all-zero blocks, the compression-stage
    /// trailer, and a sink flush. Safe to call more than once; only the
    /// first call does anything. Dropping an open writer calls this and
    /// discards the outcome.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.write_block(&ZERO_BLOCK, false)?;
        self.write_block(&ZERO_BLOCK, false)?;
        if let Some(enc) = &mut self.lz4 {
            enc.end()?;
            let out = enc.take_output();
            self.sink.write(&out)?;
        }
        self.sink.finish()?;
        self.closed = true;
        debug!("archive finalized");
        Ok(())
    }
}

impl<H: Host> Drop for TarWriter<H> {
    fn drop(&mut self) {
        // destructors must not fail; an explicit close() reports errors
        let _ = self.close();
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use similar_asserts::assert_eq;

    use super::*;

    fn collecting_writer(options: WriterOptions) -> (TarWriter, Rc<RefCell<Vec<u8>>>) {
        let collected = Rc::new(RefCell::new(Vec::new()));
        let shared = Rc::clone(&collected);
        let writer = TarWriter::with_callback(
            move |block, used| {
                assert_eq!(used, BLOCK_SIZE);
                shared.borrow_mut().extend_from_slice(block);
            },
            options,
        );
        (writer, collected)
    }

    #[test]
    fn test_finalization_on_close() {
        let (mut writer, collected) = collecting_writer(WriterOptions::default());
        assert!(writer.is_open());
        writer.close().unwrap();
        assert!(!writer.is_open());
        // an empty archive is exactly the two zero blocks
        assert_eq!(*collected.borrow(), vec![0u8; 2 * BLOCK_SIZE]);

        // close is idempotent
        writer.close().unwrap();
        assert_eq!(collected.borrow().len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_finalization_on_drop() {
        let (writer, collected) = collecting_writer(WriterOptions::default());
        drop(writer);
        assert_eq!(collected.borrow().len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_closed_writer_rejects_everything() {
        let (mut writer, _) = collecting_writer(WriterOptions::default());
        writer.close().unwrap();
        assert!(matches!(
            writer.add_directory("d", 0o755, 0, 0, 0),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(writer.stream_begin(), Err(Error::IllegalState(_))));
        assert!(matches!(
            writer.add_from_path("/etc/hostname"),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_streaming_rejected_in_callback_mode() {
        let (mut writer, _) = collecting_writer(WriterOptions::default());
        assert!(matches!(writer.stream_begin(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_streaming_state_guards() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            TarWriter::create(dir.path().join("t.tar"), WriterOptions::default()).unwrap();

        // no stream in progress yet
        assert!(matches!(
            writer.stream_data(b"x"),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            writer.stream_complete("f", 0o644, 0, 0, 0, 0),
            Err(Error::IllegalState(_))
        ));

        writer.stream_begin().unwrap();
        // double begin, and every other admission, is illegal mid-stream
        assert!(matches!(writer.stream_begin(), Err(Error::IllegalState(_))));
        assert!(matches!(
            writer.add_directory("d", 0o755, 0, 0, 0),
            Err(Error::IllegalState(_))
        ));

        writer.stream_data(b"payload").unwrap();
        writer.stream_complete("f", 0o644, 0, 0, 7, 0).unwrap();
        // back in the open state
        writer.add_directory("d", 0o755, 0, 0, 0).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_duplicate_streamed_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            TarWriter::create(dir.path().join("t.tar"), WriterOptions::default()).unwrap();
        writer.stream_begin().unwrap();
        writer.stream_complete("same", 0o644, 0, 0, 0, 0).unwrap();
        writer.stream_begin().unwrap();
        assert!(matches!(
            writer.stream_complete("same", 0o644, 0, 0, 0, 0),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_target_path_validation() {
        let (mut writer, _) = collecting_writer(WriterOptions::default());
        assert!(matches!(
            writer.add_directory("", 0o755, 0, 0, 0),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            writer.add_symlink("a/../b", "t", 0o777, 0, 0, 0),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            writer.add_symlink("link/", "t", 0o777, 0, 0, 0),
            Err(Error::Invalid(_))
        ));
        // ".." cleans down to an empty target
        assert!(matches!(
            writer.add_directory("..", 0o755, 0, 0, 0),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            writer.add_directory("/", 0o755, 0, 0, 0),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_v7_rejects_direct_special_entries() {
        let (mut writer, _) = collecting_writer(WriterOptions::default());
        assert!(matches!(
            writer.add_fifo("p", 0o644, 0, 0, 0),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            writer.add_character_device("dev/null", 0o666, 0, 0, 0, 1, 3),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            writer.add_block_device("dev/sda", 0o660, 0, 0, 0, 8, 0),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_source_not_found() {
        let (mut writer, _) = collecting_writer(WriterOptions::default());
        assert!(matches!(
            writer.add_from_path("/definitely/not/here"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_into_itself_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("self.tar");
        let mut writer = TarWriter::create(&path, WriterOptions::default()).unwrap();
        assert!(matches!(
            writer.add_from_path(&path),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_duplicate_regular_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"one").unwrap();
        std::fs::write(dir.path().join("b"), b"two").unwrap();

        let mut writer =
            TarWriter::create(dir.path().join("t.tar"), WriterOptions::default()).unwrap();
        writer
            .add_from_path_as(dir.path().join("a"), "same", false)
            .unwrap();
        // distinct inode under an already-used name
        assert!(matches!(
            writer.add_from_path_as(dir.path().join("b"), "same", false),
            Err(Error::IllegalState(_))
        ));
    }
}
