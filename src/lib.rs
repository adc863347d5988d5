//! Streaming writer for UNIX v7 and POSIX ustar tar archives, with
//! optional LZ4 frame compression.
//!
//! The writer emits bit-exact tar streams either to a seekable file or to
//! an unseekable consumer (a callback receiving zero-padded 512-byte
//! blocks, suitable for piping to a socket or stdout). Three ways of
//! getting data in:
//!
//! - **Filesystem scan**: [`TarWriter::add_from_path`] and
//!   [`TarWriter::add_from_path_recursive`] archive existing objects,
//!   coalescing hard links by inode identity along the way.
//! - **Caller-driven streaming**: [`TarWriter::stream_begin`] /
//!   [`TarWriter::stream_data`] / [`TarWriter::stream_complete`] write a
//!   regular file whose size is unknown up front; the header is
//!   backpatched on completion (file output only — a callback cannot
//!   seek).
//! - **Direct admission**: `add_directory`, `add_symlink`, `add_hardlink`,
//!   `add_fifo` and the device methods compose entries entirely from
//!   caller-supplied attributes, with no filesystem object behind them.
//!
//! With [`Compression::Lz4`] the whole archive becomes one LZ4 frame. Tar
//! headers are stored uncompressed inside the frame, which is what keeps
//! the streaming backpatch working underneath compression.
//!
//! # Example
//!
//! ```no_run
//! use tarsink::{Compression, Format, TarWriter, WriterOptions};
//!
//! let options = WriterOptions {
//!     format: Format::Ustar,
//!     compression: Compression::Lz4,
//! };
//! let mut tar = TarWriter::create("photos.tar.lz4", options)?;
//! tar.add_from_path_recursive("photos")?;
//! tar.close()?;
//! # Ok::<(), tarsink::Error>(())
//! ```
//!
//! Reading archives back is out of scope; any tar reader will do.

pub mod error;
pub mod format;
pub mod fs;
mod lz4_encoder;
mod sink;
mod util;
pub mod writer;

pub use error::{Error, Result};
pub use format::{Block, Entry, EntryKind, Format, BLOCK_SIZE};
pub use fs::{clean_path, walk, FileId, Filesystem, Host, Identity, UnixHost};
pub use writer::{Compression, TarWriter, WriterOptions};
