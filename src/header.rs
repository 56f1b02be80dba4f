//! Container header: the first record of every `.vxi` file.
//!
//! Fixed-size, little-endian, always written at offset 0. The index pointer
//! (`index_offset`/`index_len`) starts zeroed and is patched in place by
//! `finalize()`, after the trailing index has been written in full. A reader
//! that finds a zero index pointer treats the file as never finalized.

use crate::types::BackupType;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b".vxi";

/// Format version written by this build.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 2;

/// Serialized size of the header record.
pub const HEADER_SIZE: usize = 96;

/// Header flag: block payloads are encrypted.
pub const FLAG_ENCRYPTED: u32 = 1 << 0;
/// Header flag: this file's block index contains delta entries.
pub const FLAG_DELTA_INDEX: u32 = 1 << 1;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("corrupt header: bad magic value")]
    CorruptHeader,
    #[error("unsupported format version {major}.{minor} (this build reads major {supported})")]
    UnsupportedVersion { major: u16, minor: u16, supported: u16 },
    #[error("unknown backup type code {0}")]
    UnknownBackupType(u8),
    #[error("file was never finalized: index pointer is zero")]
    MissingIndex,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Format capability value threaded through reader construction, instead of
/// ambient global state. The default accepts the build's own major version.
#[derive(Debug, Clone, Copy)]
pub struct FormatCaps {
    pub supported_major: u16,
}

impl Default for FormatCaps {
    fn default() -> Self {
        Self { supported_major: VERSION_MAJOR }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub magic: [u8; 4],
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    /// Unique id of the backup definition stored in this file.
    pub definition_id: Uuid,
    /// Parent definition id; `Uuid::nil()` for a root full backup.
    pub parent_id: Uuid,
    /// Set id shared by every file in the backup set.
    pub set_id: Uuid,
    pub backup_type: BackupType,
    /// Position within the set chain, 0 for the root.
    pub increment_number: u32,
    /// Creation time, Unix seconds.
    pub created_unix: i64,
    pub index_offset: u64,
    pub index_len: u64,
}

impl Header {
    pub fn new(set_id: Uuid, backup_type: BackupType, parent_id: Option<Uuid>, increment_number: u32) -> Self {
        Self {
            magic: *MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: 0,
            definition_id: Uuid::new_v4(),
            parent_id: parent_id.unwrap_or_else(Uuid::nil),
            set_id,
            backup_type,
            increment_number,
            created_unix: chrono::Utc::now().timestamp(),
            index_offset: 0,
            index_len: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn parent(&self) -> Option<Uuid> {
        if self.parent_id.is_nil() { None } else { Some(self.parent_id) }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u16::<LittleEndian>(self.version_major)?;
        writer.write_u16::<LittleEndian>(self.version_minor)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_all(self.definition_id.as_bytes())?;
        writer.write_all(self.parent_id.as_bytes())?;
        writer.write_all(self.set_id.as_bytes())?;
        writer.write_u8(backup_type_code(self.backup_type))?;
        writer.write_all(&[0u8; 7])?; // reserved
        writer.write_u32::<LittleEndian>(self.increment_number)?;
        writer.write_i64::<LittleEndian>(self.created_unix)?;
        writer.write_u64::<LittleEndian>(self.index_offset)?;
        writer.write_u64::<LittleEndian>(self.index_len)?;
        Ok(())
    }

    /// Read and validate a header. The magic and version are checked before
    /// any subsequent field is trusted; an unknown major version is rejected,
    /// an unknown-but-higher minor version is accepted.
    pub fn read<R: Read>(mut reader: R, caps: FormatCaps) -> Result<Self, FormatError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(FormatError::CorruptHeader);
        }
        let version_major = reader.read_u16::<LittleEndian>()?;
        let version_minor = reader.read_u16::<LittleEndian>()?;
        if version_major != caps.supported_major {
            return Err(FormatError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
                supported: caps.supported_major,
            });
        }
        let flags = reader.read_u32::<LittleEndian>()?;
        let definition_id = read_uuid(&mut reader)?;
        let parent_id = read_uuid(&mut reader)?;
        let set_id = read_uuid(&mut reader)?;
        let type_code = reader.read_u8()?;
        let backup_type = backup_type_from_code(type_code)
            .ok_or(FormatError::UnknownBackupType(type_code))?;
        let mut reserved = [0u8; 7];
        reader.read_exact(&mut reserved)?;
        let increment_number = reader.read_u32::<LittleEndian>()?;
        let created_unix = reader.read_i64::<LittleEndian>()?;
        let index_offset = reader.read_u64::<LittleEndian>()?;
        let index_len = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            magic,
            version_major,
            version_minor,
            flags,
            definition_id,
            parent_id,
            set_id,
            backup_type,
            increment_number,
            created_unix,
            index_offset,
            index_len,
        })
    }
}

fn read_uuid<R: Read>(mut reader: R) -> io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    reader.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

fn backup_type_code(t: BackupType) -> u8 {
    match t {
        BackupType::Full => 0,
        BackupType::Incremental => 1,
        BackupType::Differential => 2,
        BackupType::SyntheticFull => 3,
    }
}

fn backup_type_from_code(c: u8) -> Option<BackupType> {
    match c {
        0 => Some(BackupType::Full),
        1 => Some(BackupType::Incremental),
        2 => Some(BackupType::Differential),
        3 => Some(BackupType::SyntheticFull),
        _ => None,
    }
}
