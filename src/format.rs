//! The tar wire format: entry model, octal field encoding and the 512-byte
//! header layout for the UNIX v7 and POSIX ustar variants.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Fixed unit of tar I/O. Every header and every (zero-padded) run of file
/// data occupies a whole number of these.
pub const BLOCK_SIZE: usize = 512;

/// A single 512-byte tar block.
pub type Block = [u8; BLOCK_SIZE];

pub(crate) const ZERO_BLOCK: Block = [0u8; BLOCK_SIZE];

/// The tar variant an archive is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Historic UNIX v7 tar: regular files, hard links, symbolic links, and
    /// directories (encoded as regular files with a trailing `/`).
    #[default]
    UnixV7,
    /// POSIX ustar: adds devices and FIFOs, owner/group names, the `ustar`
    /// magic, and 155-byte path prefix splitting.
    Ustar,
}

impl Format {
    /// Whether this format can express an entry of the given kind.
    ///
    /// Walks silently skip unsupported kinds; direct admission of one is an
    /// error. Either way nothing inexpressible reaches the encoder.
    pub fn supports(self, kind: EntryKind) -> bool {
        match self {
            Format::UnixV7 => matches!(
                kind,
                EntryKind::Regular
                    | EntryKind::Hardlink
                    | EntryKind::Symlink
                    | EntryKind::Directory
            ),
            Format::Ustar => kind != EntryKind::Contiguous,
        }
    }
}

/// Classification of an archive entry, with the typeflag tag character it
/// is encoded as at header offset 156.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Hardlink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    /// Contiguous files ('7') are rejected by the writer.
    Contiguous,
}

impl EntryKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            EntryKind::Regular => b'0',
            EntryKind::Hardlink => b'1',
            EntryKind::Symlink => b'2',
            EntryKind::CharDevice => b'3',
            EntryKind::BlockDevice => b'4',
            EntryKind::Directory => b'5',
            EntryKind::Fifo => b'6',
            EntryKind::Contiguous => b'7',
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::CharDevice | EntryKind::BlockDevice)
    }
}

/// In-memory description of one archive entry, before encoding.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Archive name, already passed through the relative-path policy.
    pub name: String,
    /// Lower 12 permission bits; anything above is masked off on encode.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Payload size in bytes; 0 for every non-regular kind.
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub kind: EntryKind,
    /// Target of a hard link or symlink; empty otherwise.
    pub link_name: String,
    /// Device numbers; 0 unless `kind.is_device()`.
    pub dev_major: u32,
    pub dev_minor: u32,
}

impl Entry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            kind,
            link_name: String::new(),
            dev_major: 0,
            dev_minor: 0,
        }
    }
}

/// The 512-byte header record. UNIX v7 headers use the fields up to
/// `linkname` and leave the rest zeroed; ustar fills the remainder.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
#[allow(dead_code)]
struct RawHeader {
    name: [u8; 100],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    cksum: [u8; 8],
    typeflag: [u8; 1],
    linkname: [u8; 100],
    magic: [u8; 6],
    version: [u8; 2],
    uname: [u8; 32],
    gname: [u8; 32],
    dev_major: [u8; 8],
    dev_minor: [u8; 8],
    prefix: [u8; 155],
    pad: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<RawHeader>() == BLOCK_SIZE);

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

/// Owner and group names for the ustar `uname`/`gname` fields. Ignored for
/// UNIX v7 headers.
#[derive(Debug, Default)]
pub(crate) struct Ownership<'a> {
    pub user: &'a str,
    pub group: &'a str,
}

/// Renders `value` as right-justified, zero-padded octal ASCII of exactly
/// `width` characters. A value too large for the width keeps only its
/// low-order digits.
fn octal(value: u64, width: usize) -> String {
    let s = format!("{value:0width$o}");
    if s.len() > width {
        s[s.len() - width..].to_string()
    } else {
        s
    }
}

/// Writes `value` as octal digits of the field width minus one, leaving the
/// final byte as the customary NUL terminator.
fn put_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    field[..width].copy_from_slice(octal(value, width).as_bytes());
}

/// Copies up to `field.len()` bytes of `s` into the field. No terminator is
/// appended; untouched bytes keep their prior content.
fn put_str(field: &mut [u8], s: &str) {
    let n = s.len().min(field.len());
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Computes and stores the header checksum: the unsigned sum of all 512
/// bytes with the checksum field itself read as eight ASCII spaces, written
/// as six octal digits followed by NUL and space.
pub(crate) fn checksum(block: &mut Block) {
    block[148..156].fill(b' ');
    let sum: u32 = block.iter().map(|b| u32::from(*b)).sum();
    block[148..154].copy_from_slice(octal(u64::from(sum), 6).as_bytes());
    block[154] = 0;
}

/// Finds the last path separator within the 155-byte candidate prefix
/// region, returning the prefix and the remaining name.
fn split_ustar_name(name: &str) -> Option<(&str, &str)> {
    let limit = name.len().min(PREFIX_LEN);
    name.as_bytes()[..limit]
        .iter()
        .rposition(|b| *b == b'/')
        .map(|i| (&name[..i], &name[i + 1..]))
}

/// Encodes an entry descriptor as one 512-byte header block.
///
/// Directory names get a trailing `/` appended if missing; UNIX v7 encodes
/// directories as regular files (the trailing slash is the only marker).
/// Names longer than the 100-byte field are prefix-split for ustar, and
/// silently truncated for UNIX v7 — a known lossy behavior of that format.
pub(crate) fn build_header(entry: &Entry, format: Format, owner: &Ownership) -> Result<Block> {
    if entry.kind == EntryKind::Contiguous {
        return Err(Error::invalid("contiguous files cannot be archived"));
    }
    if !format.supports(entry.kind) {
        return Err(Error::unsupported(format!(
            "{:?} entries cannot be represented in {:?} archives",
            entry.kind, format
        )));
    }

    let mut name = entry.name.clone();
    if entry.kind == EntryKind::Directory && !name.ends_with('/') {
        name.push('/');
    }
    if format == Format::Ustar && name.len() > NAME_LEN + 1 + PREFIX_LEN - 1 {
        return Err(Error::invalid(format!(
            "name is too long for ustar prefix splitting: {name:?}"
        )));
    }

    let wire_kind = match (format, entry.kind) {
        // v7 has no directory tag; the trailing slash carries the meaning
        (Format::UnixV7, EntryKind::Directory) => EntryKind::Regular,
        (_, kind) => kind,
    };

    let mut block = ZERO_BLOCK;
    // the cast cannot fail: a block is exactly one RawHeader, align 1
    let Ok(hdr) = RawHeader::mut_from_bytes(&mut block[..]) else {
        unreachable!()
    };

    match (format, split_ustar_name(&name)) {
        (Format::Ustar, Some((prefix, tail))) if name.len() > NAME_LEN => {
            put_str(&mut hdr.prefix, prefix);
            put_str(&mut hdr.name, tail);
        }
        // fits as-is, or v7 / no usable separator: truncate silently
        _ => put_str(&mut hdr.name, &name),
    }

    put_octal(&mut hdr.mode, u64::from(entry.mode & 0o7777));
    put_octal(&mut hdr.uid, u64::from(entry.uid));
    put_octal(&mut hdr.gid, u64::from(entry.gid));
    put_octal(&mut hdr.size, entry.size);
    put_octal(&mut hdr.mtime, entry.mtime as u64);
    hdr.typeflag[0] = wire_kind.tag();
    put_str(&mut hdr.linkname, &entry.link_name);

    if format == Format::Ustar {
        hdr.magic = *b"ustar\0";
        hdr.version = *b"00";
        put_str(&mut hdr.uname, owner.user);
        put_str(&mut hdr.gname, owner.group);
        put_octal(&mut hdr.dev_major, u64::from(entry.dev_major));
        put_octal(&mut hdr.dev_minor, u64::from(entry.dev_minor));
    }

    checksum(&mut block);
    Ok(block)
}
