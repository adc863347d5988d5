//! The byte sink behind the writer: either a buffered, seekable file or a
//! forward-only callback that receives zero-padded 512-byte blocks.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::format::{Block, BLOCK_SIZE, ZERO_BLOCK};

/// Blocks buffered in front of the file handle before draining.
const FILE_BUFFER_BLOCKS: usize = 512; // 512 * 512 = 256 KiB

pub(crate) type BlockFn = Box<dyn FnMut(&Block, usize)>;

pub(crate) enum Sink {
    File(BufWriter<File>),
    Callback {
        emit: BlockFn,
        /// Bytes carried until a full block is available; only ever
        /// non-empty for compressed output, which is not block-aligned.
        partial: Vec<u8>,
    },
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the callback doesn't impl Debug
        match self {
            Sink::File(w) => f.debug_tuple("Sink::File").field(w).finish(),
            Sink::Callback { partial, .. } => f
                .debug_struct("Sink::Callback")
                .field("partial", &partial.len())
                .finish(),
        }
    }
}

impl Sink {
    pub fn file(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Sink::File(BufWriter::with_capacity(
            FILE_BUFFER_BLOCKS * BLOCK_SIZE,
            file,
        )))
    }

    pub fn callback(emit: impl FnMut(&Block, usize) + 'static) -> Self {
        Sink::Callback {
            emit: Box::new(emit),
            partial: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Sink::File(..))
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        match self {
            Sink::File(w) => Ok(w.write_all(data)?),
            Sink::Callback { emit, partial } => {
                if !partial.is_empty() {
                    let take = (BLOCK_SIZE - partial.len()).min(data.len());
                    partial.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if partial.len() == BLOCK_SIZE {
                        let mut block = ZERO_BLOCK;
                        block.copy_from_slice(partial);
                        emit(&block, BLOCK_SIZE);
                        partial.clear();
                    }
                }
                while data.len() >= BLOCK_SIZE {
                    let block: &Block = data[..BLOCK_SIZE].try_into().unwrap();
                    emit(block, BLOCK_SIZE);
                    data = &data[BLOCK_SIZE..];
                }
                partial.extend_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Sink::File(w) => Ok(w.flush()?),
            // a trailing sub-block stays buffered until finish()
            Sink::Callback { .. } => Ok(()),
        }
    }

    pub fn tell(&mut self) -> Result<u64> {
        match self {
            Sink::File(w) => Ok(w.stream_position()?),
            Sink::Callback { .. } => Err(Error::IllegalState("callback output is not seekable")),
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        match self {
            Sink::File(w) => {
                w.seek(SeekFrom::Start(pos))?;
                Ok(())
            }
            Sink::Callback { .. } => Err(Error::IllegalState("callback output is not seekable")),
        }
    }

    /// Final drain on close: flushes the file buffer, or pads and emits the
    /// carried sub-block so the consumer only ever sees full blocks.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            Sink::File(w) => Ok(w.flush()?),
            Sink::Callback { emit, partial } => {
                if !partial.is_empty() {
                    let mut block = ZERO_BLOCK;
                    block[..partial.len()].copy_from_slice(partial);
                    emit(&block, BLOCK_SIZE);
                    partial.clear();
                }
                Ok(())
            }
        }
    }
}
