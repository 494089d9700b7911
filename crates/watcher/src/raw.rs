//! Raw notification entry layout
//!
//! A filled change buffer holds a chain of variable-length entries laid out
//! like `FILE_NOTIFY_EXTENDED_INFORMATION` (little endian, UTF-16 names):
//!
//! ```text
//! offset  size  field
//!      0     4  next_entry_offset   (0 = last entry in the batch)
//!      4     4  action
//!      8     8  creation_time
//!     16     8  modification_time
//!     24     8  change_time
//!     32     8  access_time
//!     40     8  allocated_size
//!     48     8  size
//!     56     4  attributes
//!     60     4  reparse_tag
//!     64     8  file_id
//!     72     8  parent_file_id
//!     80     4  name_length         (bytes)
//!     84     n  name                (UTF-16)
//! ```
//!
//! The Windows backend receives this layout straight from the kernel. Other
//! backends encode their events into it, so the decode path is shared.

use std::fmt;
use std::ops::BitOr;

pub const ACTION_ADDED: u32 = 0x1;
pub const ACTION_REMOVED: u32 = 0x2;
pub const ACTION_MODIFIED: u32 = 0x3;
pub const ACTION_RENAMED_OLD_NAME: u32 = 0x4;
pub const ACTION_RENAMED_NEW_NAME: u32 = 0x5;

pub const ATTRIBUTE_READONLY: u32 = 0x1;
pub const ATTRIBUTE_DIRECTORY: u32 = 0x10;
pub const ATTRIBUTE_NORMAL: u32 = 0x80;

/// Byte offset of the name field, i.e. the fixed header size
pub const HEADER_LEN: usize = 84;

/// Entries start on 8-byte boundaries
const ENTRY_ALIGN: usize = 8;

/// Change types a read subscribes to, mirroring `FILE_NOTIFY_CHANGE_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeFilter(u32);

impl ChangeFilter {
    pub const FILE_NAME: Self = Self(0x1);
    pub const DIR_NAME: Self = Self(0x2);
    pub const LAST_WRITE: Self = Self(0x10);
    pub const CREATION: Self = Self(0x40);

    /// Name changes, content writes and creations
    pub const DEFAULT: Self =
        Self(Self::FILE_NAME.0 | Self::DIR_NAME.0 | Self::LAST_WRITE.0 | Self::CREATION.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for ChangeFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One decoded entry, borrowing its name from the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry<'a> {
    pub next_entry_offset: u32,
    pub action: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub size: u64,
    pub attributes: u32,
    name: &'a [u8],
}

impl RawEntry<'_> {
    /// Name as UTF-16 code units
    pub fn name_wide(&self) -> impl Iterator<Item = u16> + '_ {
        self.name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Buffer contents that do not form a valid entry chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawError {
    /// An entry header or name runs past the transferred bytes
    Truncated { offset: usize },
    /// A non-zero next offset that does not move past the current header
    BadOffset { offset: usize, next: u32 },
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "entry at byte {} is truncated", offset),
            Self::BadOffset { offset, next } => {
                write!(f, "entry at byte {} has invalid next offset {}", offset, next)
            }
        }
    }
}

impl std::error::Error for RawError {}

/// Iterator over the entry chain of a filled buffer.
///
/// Stops after the entry whose `next_entry_offset` is zero, or after the
/// first malformed entry (yielded as an error).
pub struct Entries<'a> {
    buffer: &'a [u8],
    offset: usize,
    done: bool,
}

/// Walk the entries in `buffer`, which must hold only the transferred bytes.
pub fn entries(buffer: &[u8]) -> Entries<'_> {
    Entries {
        buffer,
        offset: 0,
        done: buffer.is_empty(),
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<RawEntry<'a>, RawError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = self.offset;
        let entry = match parse_entry(self.buffer, offset) {
            Ok(entry) => entry,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        // The chain ends on this field, not on buffer exhaustion
        let next = entry.next_entry_offset;
        if next == 0 {
            self.done = true;
        } else if (next as usize) < HEADER_LEN {
            self.done = true;
            return Some(Err(RawError::BadOffset { offset, next }));
        } else {
            self.offset = offset + next as usize;
        }
        Some(Ok(entry))
    }
}

fn parse_entry(buffer: &[u8], offset: usize) -> Result<RawEntry<'_>, RawError> {
    let header = buffer
        .get(offset..offset + HEADER_LEN)
        .ok_or(RawError::Truncated { offset })?;

    let name_len = read_u32(header, 80) as usize;
    let name_start = offset + HEADER_LEN;
    let name = buffer
        .get(name_start..name_start + name_len)
        .ok_or(RawError::Truncated { offset })?;

    Ok(RawEntry {
        next_entry_offset: read_u32(header, 0),
        action: read_u32(header, 4),
        creation_time: read_u64(header, 8),
        modification_time: read_u64(header, 16),
        change_time: read_u64(header, 24),
        access_time: read_u64(header, 32),
        size: read_u64(header, 48),
        attributes: read_u32(header, 56),
        name,
    })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Owned entry used by backends that synthesize raw buffers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryBuilder {
    pub action: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub size: u64,
    pub attributes: u32,
    /// Name relative to the watched directory, as UTF-16
    pub name: Vec<u16>,
}

impl EntryBuilder {
    pub fn new(action: u32, name: &str) -> Self {
        Self {
            action,
            name: name.encode_utf16().collect(),
            ..Self::default()
        }
    }

    /// Bytes this entry occupies in a chain, including alignment padding
    pub fn encoded_len(&self) -> usize {
        align(HEADER_LEN + self.name.len() * 2)
    }
}

/// Encode `entries` as a chain at the start of `buffer`.
///
/// Returns the number of bytes written, or `None` if they do not fit (the
/// buffer contents are then unspecified). An empty slice writes nothing.
pub fn encode(entries: &[EntryBuilder], buffer: &mut [u8]) -> Option<usize> {
    let mut offset = 0;
    for (i, entry) in entries.iter().enumerate() {
        let name_bytes = entry.name.len() * 2;
        let unpadded = HEADER_LEN + name_bytes;
        if offset + unpadded > buffer.len() {
            return None;
        }

        let is_last = i + 1 == entries.len();
        let next = if is_last { 0 } else { entry.encoded_len() as u32 };

        let out = &mut buffer[offset..offset + unpadded];
        out[..HEADER_LEN].fill(0);
        out[0..4].copy_from_slice(&next.to_le_bytes());
        out[4..8].copy_from_slice(&entry.action.to_le_bytes());
        out[8..16].copy_from_slice(&entry.creation_time.to_le_bytes());
        out[16..24].copy_from_slice(&entry.modification_time.to_le_bytes());
        out[24..32].copy_from_slice(&entry.change_time.to_le_bytes());
        out[32..40].copy_from_slice(&entry.access_time.to_le_bytes());
        out[40..48].copy_from_slice(&entry.size.to_le_bytes());
        out[48..56].copy_from_slice(&entry.size.to_le_bytes());
        out[56..60].copy_from_slice(&entry.attributes.to_le_bytes());
        out[80..84].copy_from_slice(&(name_bytes as u32).to_le_bytes());
        for (unit, dst) in entry.name.iter().zip(out[HEADER_LEN..].chunks_exact_mut(2)) {
            dst.copy_from_slice(&unit.to_le_bytes());
        }

        offset += if is_last { unpadded } else { entry.encoded_len() };
    }
    Some(offset)
}

fn align(len: usize) -> usize {
    (len + ENTRY_ALIGN - 1) & !(ENTRY_ALIGN - 1)
}
