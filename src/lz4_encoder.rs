//! In-line LZ4 frame encoder stage.
//!
//! Sits between the tar block writer and the byte sink when compression is
//! enabled. The whole archive becomes a single LZ4 frame with 256 KiB
//! independent blocks and no checksums beyond the frame descriptor's.
//!
//! Tar header blocks take a special path: they are stored *uncompressed*
//! inside the frame and the pending compressed data is flushed first, so
//! the frame offset reported just before a header write is exactly where
//! those 512 bytes (plus the 4-byte block word) land. Rewriting the same
//! span later with a corrected header leaves the frame valid — this is what
//! makes streaming entries (placeholder header, backpatch on completion)
//! work underneath compression.

use lz4_flex::block;
use xxhash_rust::xxh32::xxh32;

use crate::error::{Error, Result};

const FRAME_MAGIC: [u8; 4] = 0x184D2204u32.to_le_bytes();
/// FLG: frame version 01, independent blocks, no block or content
/// checksums, no content size, no dictionary.
const FRAME_FLG: u8 = 0x60;
/// BD: 256 KiB maximum block size.
const FRAME_BD: u8 = 0x50;
/// Input gathered per frame block.
const MAX_BLOCK_SIZE: usize = 256 * 1024;
/// High bit of the block word marks a stored (uncompressed) block.
const UNCOMPRESSED_BIT: u32 = 0x8000_0000;

pub(crate) struct Lz4Encoder {
    /// Input awaiting compression, always shorter than one frame block.
    pending: Vec<u8>,
    /// Encoded frame bytes awaiting drain to the sink.
    out: Vec<u8>,
    /// Frame bytes handed out so far; the position the writer reports.
    emitted: u64,
}

impl Lz4Encoder {
    pub fn new() -> Self {
        let mut out = Vec::with_capacity(MAX_BLOCK_SIZE);
        out.extend_from_slice(&FRAME_MAGIC);
        out.push(FRAME_FLG);
        out.push(FRAME_BD);
        // descriptor checksum: second byte of xxh32 over the descriptor
        out.push((xxh32(&[FRAME_FLG, FRAME_BD], 0) >> 8) as u8);
        Self {
            pending: Vec::new(),
            out,
            emitted: 0,
        }
    }

    /// Buffers input for compression, cutting a frame block whenever a full
    /// 256 KiB has been gathered.
    pub fn compress_update(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= MAX_BLOCK_SIZE {
            let rest = self.pending.split_off(MAX_BLOCK_SIZE);
            let full = std::mem::replace(&mut self.pending, rest);
            self.emit_block(&full)?;
        }
        Ok(())
    }

    /// Stores `data` literally in the frame, after flushing whatever is
    /// pending so the stored bytes cannot be reordered past earlier input.
    pub fn uncompressed_update(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty() && data.len() <= MAX_BLOCK_SIZE);
        self.flush()?;
        self.out
            .extend_from_slice(&((data.len() as u32) | UNCOMPRESSED_BIT).to_le_bytes());
        self.out.extend_from_slice(data);
        Ok(())
    }

    /// Compresses and emits any buffered input as a short frame block.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let data = std::mem::take(&mut self.pending);
            self.emit_block(&data)?;
        }
        Ok(())
    }

    /// Ends the frame: flushes buffered input and writes the end mark.
    pub fn end(&mut self) -> Result<()> {
        self.flush()?;
        self.out.extend_from_slice(&0u32.to_le_bytes());
        Ok(())
    }

    fn emit_block(&mut self, data: &[u8]) -> Result<()> {
        let mut compressed = vec![0u8; block::get_maximum_output_size(data.len())];
        let n =
            block::compress_into(data, &mut compressed).map_err(|e| Error::Codec(e.to_string()))?;
        if n < data.len() {
            self.out.extend_from_slice(&(n as u32).to_le_bytes());
            self.out.extend_from_slice(&compressed[..n]);
        } else {
            // incompressible: the frame format stores such blocks raw
            self.out
                .extend_from_slice(&((data.len() as u32) | UNCOMPRESSED_BIT).to_le_bytes());
            self.out.extend_from_slice(data);
        }
        Ok(())
    }

    /// Takes the frame bytes gathered since the last drain, advancing the
    /// emitted-byte counter that [`position`](Self::position) reports.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.emitted += self.out.len() as u64;
        std::mem::take(&mut self.out)
    }

    /// Current frame position in emitted bytes. Exact only directly after a
    /// flush and drain, which is when the writer samples it.
    pub fn position(&self) -> u64 {
        self.emitted
    }

    /// Re-aligns the position counter with the sink after a seek.
    pub fn seek(&mut self, pos: u64) {
        self.emitted = pos;
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use lz4_flex::frame::FrameDecoder;
    use similar_asserts::assert_eq;

    use super::*;

    fn decode(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        FrameDecoder::new(frame).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_frame_round_trip() {
        let input: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut enc = Lz4Encoder::new();
        enc.compress_update(&input).unwrap();
        enc.end().unwrap();
        let frame = enc.take_output();
        assert!(frame.len() < input.len());
        assert_eq!(decode(&frame), input);
    }

    #[test]
    fn test_multi_block_input() {
        // spans several 256 KiB frame blocks
        let input = vec![42u8; MAX_BLOCK_SIZE * 2 + 1000];
        let mut enc = Lz4Encoder::new();
        enc.compress_update(&input).unwrap();
        enc.end().unwrap();
        assert_eq!(decode(&enc.take_output()), input);
    }

    #[test]
    fn test_stored_blocks_round_trip() {
        let header = [7u8; 512];
        let data = b"payload payload payload".repeat(40);

        let mut enc = Lz4Encoder::new();
        enc.uncompressed_update(&header).unwrap();
        enc.flush().unwrap();
        enc.compress_update(&data).unwrap();
        enc.end().unwrap();

        let mut expected = header.to_vec();
        expected.extend_from_slice(&data);
        assert_eq!(decode(&enc.take_output()), expected);
    }

    #[test]
    fn test_position_counts_emitted_bytes() {
        let mut enc = Lz4Encoder::new();
        let mut frame = enc.take_output();
        assert_eq!(enc.position(), 7); // magic + FLG + BD + HC

        enc.uncompressed_update(&[1u8; 512]).unwrap();
        enc.flush().unwrap();
        frame.extend(enc.take_output());
        // a stored block is exactly the 4-byte block word plus the payload
        assert_eq!(enc.position(), 7 + 4 + 512);
        assert_eq!(frame.len() as u64, enc.position());
    }

    #[test]
    fn test_stored_block_rewrite_keeps_frame_valid() {
        // mimics the streaming backpatch: placeholder header, payload,
        // then the placeholder span is overwritten with the real header
        let payload = b"0123456789".repeat(100);

        let mut enc = Lz4Encoder::new();
        let mut frame = enc.take_output();
        let header_pos = enc.position() as usize;
        enc.uncompressed_update(&[0u8; 512]).unwrap();
        enc.flush().unwrap();
        frame.extend(enc.take_output());
        enc.compress_update(&payload).unwrap();
        enc.end().unwrap();
        frame.extend(enc.take_output());

        let real_header = [9u8; 512];
        frame[header_pos + 4..header_pos + 4 + 512].copy_from_slice(&real_header);

        let mut expected = real_header.to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(decode(&frame), expected);
    }

    #[test]
    fn test_flush_cuts_short_blocks() {
        let mut enc = Lz4Encoder::new();
        enc.compress_update(b"first").unwrap();
        enc.flush().unwrap();
        enc.compress_update(b"second").unwrap();
        enc.end().unwrap();
        assert_eq!(decode(&enc.take_output()), b"firstsecond");
    }
}
