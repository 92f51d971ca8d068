//! Block model for the RAR 4.x block layout.
//!
//! Every block starts with the same 7-byte prefix:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | header CRC (low 16 bits of CRC-32 over bytes 2..size) |
//! | 2 | 1 | block type |
//! | 3 | 2 | flags |
//! | 5 | 2 | header size, prefix included, trailing content excluded |
//!
//! The Marker block is the fixed signature `Rar!\x1A\x07\x00`; its "CRC"
//! bytes are the magic `Ra`.  Entry blocks are followed by `packed_size`
//! bytes of stored content.  Any other block with [`FLAG_LONG_BLOCK`] set is
//! followed by `ADD_SIZE` bytes (u32 at offset 7) that scanners skip.

use std::io::{self, Read};

use crate::codec::{
    content_checksum, decode_int, decode_u16, decode_u32, encode_int, header_checksum, header_crc,
};
use crate::error::{ArchiveError, Result};

// ── Constants ────────────────────────────────────────────────────────────────

/// Size of the common block prefix.
pub const PREFIX_SIZE: usize = 7;

/// The complete Marker block.
pub const MARKER_SIGNATURE: [u8; 7] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00];

pub const MARKER_TYPE:         u8 = 0x72;
pub const ARCHIVE_HEADER_TYPE: u8 = 0x73;
pub const ENTRY_TYPE:          u8 = 0x74;
/// Service sub-block (comments, recovery records, ...).
pub const SUB_BLOCK_TYPE:      u8 = 0x7A;
/// End-of-archive block written by RAR 3.x and later.
pub const END_OF_ARCHIVE_TYPE: u8 = 0x7B;

/// ArchiveHeader size: prefix + reserved u16 + reserved u32.
pub const ARCHIVE_HEADER_SIZE: u16 = 13;
/// Entry header size before the name.
pub const ENTRY_FIXED_SIZE: usize = 32;

/// Block is followed by trailing data of declared size.
pub const FLAG_LONG_BLOCK: u16 = 0x8000;
/// Entry carries high 32-bit words of both sizes before the name.
pub const FLAG_LARGE:      u16 = 0x0100;
/// Entry name is `ascii \0 encoded-unicode`.
pub const FLAG_UNICODE:    u16 = 0x0200;
/// Dictionary bits all set: the entry is a directory.
pub const FLAG_DIRECTORY:  u16 = 0x00E0;

pub const ATTR_DIRECTORY:      u32 = 0x0010;
pub const ATTR_ARCHIVE:        u32 = 0x0020;
pub const ATTR_UNIX_DIRECTORY: u32 = 0x4000;
const UNIX_FILE_TYPE_MASK:     u32 = 0xF000;

pub const HOST_OS_MSDOS: u8 = 0;
pub const HOST_OS_WIN32: u8 = 2;
pub const HOST_OS_UNIX:  u8 = 3;

/// Version needed to extract a stored entry.
pub const UNPACK_VERSION: u8 = 20;
/// Packing method "store".
pub const METHOD_STORE:   u8 = 0x30;

/// Path separator used inside entry names on the wire.
pub const WIRE_SEPARATOR: char = '\\';

// ── Prefix ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPrefix {
    pub crc:        u16,
    pub block_type: u8,
    pub flags:      u16,
    pub size:       u16,
}

impl BlockPrefix {
    pub fn parse(bytes: &[u8; PREFIX_SIZE]) -> Self {
        Self {
            crc:        u16::from_le_bytes([bytes[0], bytes[1]]),
            block_type: bytes[2],
            flags:      u16::from_le_bytes([bytes[3], bytes[4]]),
            size:       u16::from_le_bytes([bytes[5], bytes[6]]),
        }
    }

    /// A declared size that does not extend past the prefix ends a scan.
    pub fn is_terminal(&self) -> bool {
        self.size as usize <= PREFIX_SIZE
    }
}

// ── Raw block ────────────────────────────────────────────────────────────────

/// Outcome of reading one block header from a stream.
#[derive(Debug)]
pub enum ReadOutcome {
    Block(RawBlock),
    /// Clean end of stream, no bytes left.
    End,
    /// A terminal prefix (declared size ≤ 7) or a partial prefix at EOF.
    /// Carries the number of bytes consumed.
    Terminal(usize),
}

/// A complete block header exactly as stored, checksum included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub prefix: BlockPrefix,
    pub bytes:  Vec<u8>,
}

impl RawBlock {
    /// Read the 7-byte prefix and, unless it is terminal, the rest of the
    /// declared header.  A payload shorter than declared is a short-read error.
    pub fn read<R: Read>(reader: &mut R) -> io::Result<ReadOutcome> {
        let mut head = [0u8; PREFIX_SIZE];
        let got = read_up_to(reader, &mut head)?;
        if got == 0 {
            return Ok(ReadOutcome::End);
        }
        if got < PREFIX_SIZE {
            return Ok(ReadOutcome::Terminal(got));
        }
        let prefix = BlockPrefix::parse(&head);
        if prefix.is_terminal() {
            return Ok(ReadOutcome::Terminal(PREFIX_SIZE));
        }
        let mut bytes = vec![0u8; prefix.size as usize];
        bytes[..PREFIX_SIZE].copy_from_slice(&head);
        reader.read_exact(&mut bytes[PREFIX_SIZE..])?;
        Ok(ReadOutcome::Block(RawBlock { prefix, bytes }))
    }

    pub fn block_type(&self) -> u8 {
        self.prefix.block_type
    }

    /// Whether the stored header CRC matches the header bytes.
    pub fn checksum_ok(&self) -> bool {
        header_crc(&self.bytes[2..]) == self.prefix.crc
    }

    /// Decode into the closed block variant.
    pub fn classify(&self) -> Result<Block> {
        match self.prefix.block_type {
            MARKER_TYPE         => Ok(Block::Marker),
            ARCHIVE_HEADER_TYPE => Ok(Block::ArchiveHeader),
            ENTRY_TYPE          => Ok(Block::Entry(EntryHeader::parse(&self.bytes)?)),
            other => {
                let add_size = if self.prefix.flags & FLAG_LONG_BLOCK != 0 {
                    decode_u32(&self.bytes, PREFIX_SIZE)? as u64
                } else {
                    0
                };
                Ok(Block::Unknown { block_type: other, flags: self.prefix.flags, add_size })
            }
        }
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Block variants ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Marker,
    ArchiveHeader,
    Entry(EntryHeader),
    /// Any other block type.  `add_size` is non-zero only with [`FLAG_LONG_BLOCK`].
    Unknown { block_type: u8, flags: u16, add_size: u64 },
}

impl Block {
    /// Number of stream bytes following the header that belong to this block.
    pub fn trailing_size(&self) -> u64 {
        match self {
            Block::Marker | Block::ArchiveHeader => 0,
            Block::Entry(e)                      => e.packed_size,
            Block::Unknown { add_size, .. }      => *add_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// File or directory header.  `name` is held in logical form (`/` separators).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub flags:          u16,
    pub packed_size:    u64,
    pub unpacked_size:  u64,
    pub host_os:        u8,
    pub crc32:          u32,
    pub mtime:          u32,
    pub unpack_version: u8,
    pub method:         u8,
    pub attributes:     u32,
    pub name:           String,
}

impl EntryHeader {
    /// Header for a stored file holding `content`.
    pub fn file(name: &str, content: &[u8], mtime: u32) -> Self {
        let size = content.len() as u64;
        Self {
            flags:          FLAG_LONG_BLOCK,
            packed_size:    size,
            unpacked_size:  size,
            host_os:        HOST_OS_MSDOS,
            crc32:          content_checksum(content),
            mtime,
            unpack_version: UNPACK_VERSION,
            method:         METHOD_STORE,
            attributes:     ATTR_ARCHIVE,
            name:           name.to_owned(),
        }
    }

    pub fn directory(name: &str, mtime: u32) -> Self {
        Self {
            flags:          FLAG_LONG_BLOCK | FLAG_DIRECTORY,
            packed_size:    0,
            unpacked_size:  0,
            host_os:        HOST_OS_MSDOS,
            crc32:          0,
            mtime,
            unpack_version: UNPACK_VERSION,
            method:         METHOD_STORE,
            attributes:     ATTR_DIRECTORY,
            name:           name.to_owned(),
        }
    }

    /// Unix hosts store a full `st_mode`, where 0x10 is a permission bit,
    /// so only the file-type field and the dictionary flags count there.
    pub fn kind(&self) -> EntryKind {
        let by_flags = self.flags & FLAG_DIRECTORY == FLAG_DIRECTORY;
        let by_attr = if self.host_os == HOST_OS_UNIX {
            self.attributes & UNIX_FILE_TYPE_MASK == ATTR_UNIX_DIRECTORY
        } else {
            self.attributes & (ATTR_DIRECTORY | ATTR_UNIX_DIRECTORY) != 0
        };
        if by_flags || by_attr { EntryKind::Directory } else { EntryKind::File }
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == EntryKind::Directory
    }

    /// Full block bytes, checksum first, ready to be written.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let wire_name = to_wire_name(&self.name);
        let name_bytes = wire_name.as_bytes();
        if name_bytes.len() > u16::MAX as usize - ENTRY_FIXED_SIZE {
            return Err(ArchiveError::InvalidArgument(format!(
                "entry name of {} bytes is too long", name_bytes.len()
            )));
        }
        let packed = u32::try_from(self.packed_size).map_err(|_| too_large(self.packed_size))?;
        let unpacked = u32::try_from(self.unpacked_size).map_err(|_| too_large(self.unpacked_size))?;

        let mut payload = Vec::with_capacity(ENTRY_FIXED_SIZE - PREFIX_SIZE + name_bytes.len());
        payload.extend(encode_int(packed as u64, 4)?);
        payload.extend(encode_int(unpacked as u64, 4)?);
        payload.push(self.host_os);
        payload.extend(encode_int(self.crc32 as u64, 4)?);
        payload.extend(encode_int(self.mtime as u64, 4)?);
        payload.push(self.unpack_version);
        payload.push(self.method);
        payload.extend(encode_int(name_bytes.len() as u64, 2)?);
        payload.extend(encode_int(self.attributes as u64, 4)?);
        payload.extend_from_slice(name_bytes);

        assemble(ENTRY_TYPE, self.flags & !(FLAG_LARGE | FLAG_UNICODE), &payload)
    }

    /// Parse a complete entry header (checksum first).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let flags = decode_u16(bytes, 3)?;
        let mut packed_size = decode_u32(bytes, 7)? as u64;
        let mut unpacked_size = decode_u32(bytes, 11)? as u64;
        let host_os = decode_int(bytes, 15, 1)? as u8;
        let crc32 = decode_u32(bytes, 16)?;
        let mtime = decode_u32(bytes, 20)?;
        let unpack_version = decode_int(bytes, 24, 1)? as u8;
        let method = decode_int(bytes, 25, 1)? as u8;
        let name_size = decode_u16(bytes, 26)? as usize;
        let attributes = decode_u32(bytes, 28)?;

        let mut offset = ENTRY_FIXED_SIZE;
        if flags & FLAG_LARGE != 0 {
            packed_size |= (decode_u32(bytes, offset)? as u64) << 32;
            unpacked_size |= (decode_u32(bytes, offset + 4)? as u64) << 32;
            offset += 8;
        }

        let raw_name = bytes
            .get(offset..offset + name_size)
            .ok_or_else(|| ArchiveError::Format(format!(
                "entry name of {name_size} bytes overruns header of {} bytes", bytes.len()
            )))?;
        let raw_name = if flags & FLAG_UNICODE != 0 {
            raw_name.split(|&b| b == 0).next().unwrap_or(raw_name)
        } else {
            raw_name
        };

        Ok(Self {
            flags,
            packed_size,
            unpacked_size,
            host_os,
            crc32,
            mtime,
            unpack_version,
            method,
            attributes,
            name: from_wire_name(&String::from_utf8_lossy(raw_name)),
        })
    }
}

fn too_large(size: u64) -> ArchiveError {
    ArchiveError::InvalidArgument(format!("entry of {size} bytes exceeds 4 GiB"))
}

// ── Serializers ──────────────────────────────────────────────────────────────

/// Prepend `{type, flags, size}` and the header checksum to `payload`.
fn assemble(block_type: u8, flags: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let size = PREFIX_SIZE + payload.len();
    let mut body = Vec::with_capacity(size);
    body.push(block_type);
    body.extend(encode_int(flags as u64, 2)?);
    body.extend(encode_int(size as u64, 2)?);
    body.extend_from_slice(payload);

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&header_checksum(&body));
    out.extend(body);
    Ok(out)
}

pub fn serialize_marker() -> [u8; PREFIX_SIZE] {
    MARKER_SIGNATURE
}

/// ArchiveHeader with zero flags and zeroed reserved fields.
pub fn serialize_archive_header() -> Vec<u8> {
    let reserved = [0u8; ARCHIVE_HEADER_SIZE as usize - PREFIX_SIZE];
    let mut body = vec![ARCHIVE_HEADER_TYPE, 0, 0];
    body.extend_from_slice(&ARCHIVE_HEADER_SIZE.to_le_bytes());
    body.extend_from_slice(&reserved);
    let mut out = header_checksum(&body).to_vec();
    out.extend(body);
    out
}

// ── Names ────────────────────────────────────────────────────────────────────

pub fn to_wire_name(name: &str) -> String {
    name.replace('/', "\\")
}

pub fn from_wire_name(name: &str) -> String {
    name.replace(WIRE_SEPARATOR, "/")
}
