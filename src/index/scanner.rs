//! Sequential block scanner shared by every read and rewrite path.
//!
//! The scanner walks the blocks after the preamble one at a time.  Each
//! block is assigned the next logical index, whatever its type.  Bytes that
//! trail a block (entry content, `ADD_SIZE` data) stay pending until the
//! caller reads, copies or skips them; anything left pending is skipped
//! automatically before the next block is read.
//!
//! A scan ends at the physical end of the stream, at a prefix whose
//! declared size is ≤ 7 bytes (an end-of-archive block or garbage), or at a
//! block whose trailing bytes run past the physical end.

use crate::block::{Block, RawBlock, ReadOutcome, ARCHIVE_HEADER_TYPE, PREFIX_SIZE};
use crate::error::{ArchiveError, Result};
use crate::io_stream::ArchiveStream;

/// One block as seen by the scanner.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    /// Logical index (position among all blocks after the preamble).
    pub index:  usize,
    /// Absolute offset of the block header.
    pub offset: u64,
    pub raw:    RawBlock,
    pub block:  Block,
}

/// Position `stream` on the first block after the Marker and ArchiveHeader.
///
/// The Marker's 7 bytes are consumed without inspection; the next block must
/// be an ArchiveHeader or the stream is rejected.
pub fn skip_preamble(stream: &mut ArchiveStream) -> Result<RawBlock> {
    stream.rewind()?;
    stream.read_exactly(PREFIX_SIZE)?;
    match RawBlock::read(stream)? {
        ReadOutcome::Block(raw) if raw.block_type() == ARCHIVE_HEADER_TYPE => Ok(raw),
        ReadOutcome::Block(raw) => Err(ArchiveError::Format(format!(
            "expected archive header after marker, found block type {:#04x}", raw.block_type()
        ))),
        _ => Err(ArchiveError::Format("archive header is missing".into())),
    }
}

pub struct Scanner<'a> {
    stream:     &'a mut ArchiveStream,
    next_index: usize,
    pending:    u64,
    end_offset: Option<u64>,
}

impl<'a> Scanner<'a> {
    /// Skip the preamble and start scanning at index 0.
    pub fn start(stream: &'a mut ArchiveStream) -> Result<Self> {
        skip_preamble(stream)?;
        Ok(Self::resume(stream))
    }

    /// Start scanning at the current stream position (preamble already consumed).
    pub fn resume(stream: &'a mut ArchiveStream) -> Self {
        Self { stream, next_index: 0, pending: 0, end_offset: None }
    }

    pub fn next_block(&mut self) -> Result<Option<ScannedBlock>> {
        self.skip_content()?;
        let offset = self.stream.position()?;
        if self.stream.at_end()? {
            self.end_offset = Some(offset);
            return Ok(None);
        }
        match RawBlock::read(&mut *self.stream)? {
            ReadOutcome::Block(raw) => {
                let block = raw.classify()?;
                let trailing = block.trailing_size();
                let remaining = self.remaining()?;
                if trailing > remaining {
                    log::warn!("{}: block at offset {} declares {} trailing bytes but only {} remain",
                        self.stream.path().display(), offset, trailing, remaining);
                    self.end_offset = Some(offset);
                    return Ok(None);
                }
                self.pending = trailing;
                let index = self.next_index;
                self.next_index += 1;
                Ok(Some(ScannedBlock { index, offset, raw, block }))
            }
            ReadOutcome::End => {
                self.end_offset = Some(offset);
                Ok(None)
            }
            ReadOutcome::Terminal(consumed) if consumed < PREFIX_SIZE => {
                log::warn!("{} ends with a truncated block header at offset {} ({} bytes)",
                    self.stream.path().display(), offset, consumed);
                self.end_offset = Some(offset);
                Ok(None)
            }
            ReadOutcome::Terminal(consumed) => {
                log::debug!("scan of {} stopped by terminal block at offset {} ({} bytes)",
                    self.stream.path().display(), offset, consumed);
                self.end_offset = Some(offset);
                Ok(None)
            }
        }
    }

    /// Read the pending trailing bytes, at most `limit` of them when given.
    pub fn read_content(&mut self, limit: Option<u64>) -> Result<Vec<u8>> {
        let n = limit.map_or(self.pending, |l| l.min(self.pending));
        if n > self.remaining()? {
            return Err(ArchiveError::Format("entry content runs past end of archive".into()));
        }
        let n = usize::try_from(n)
            .map_err(|_| ArchiveError::Format(format!("entry content of {n} bytes is too large")))?;
        let data = self.stream.read_exactly(n)?;
        self.pending -= n as u64;
        Ok(data)
    }

    /// Copy the pending trailing bytes verbatim to the end of `dst`.
    pub fn copy_content(&mut self, dst: &mut ArchiveStream) -> Result<()> {
        if self.pending > 0 {
            self.stream.copy_to(dst, self.pending)?;
            self.pending = 0;
        }
        Ok(())
    }

    /// Seek past the pending trailing bytes.
    pub fn skip_content(&mut self) -> Result<()> {
        if self.pending > 0 {
            let delta = i64::try_from(self.pending).map_err(|_| ArchiveError::Format(format!(
                "trailing size {} cannot be skipped", self.pending
            )))?;
            self.stream.seek_relative(delta)?;
            self.pending = 0;
        }
        Ok(())
    }

    /// Bytes between the cursor and the physical end.
    fn remaining(&mut self) -> Result<u64> {
        let position = self.stream.position()?;
        Ok(self.stream.len()?.saturating_sub(position))
    }

    /// Number of blocks returned so far.
    pub fn blocks_seen(&self) -> usize {
        self.next_index
    }

    /// Offset where the scan stopped, once it has stopped.
    pub fn end_offset(&self) -> Option<u64> {
        self.end_offset
    }

    /// End the scan and park the cursor one byte before the physical end.
    pub fn finish(self) -> Result<()> {
        self.stream.park()?;
        Ok(())
    }
}
