//! Layout snapshot stored as the first metadata record of every container.
//!
//! The snapshot is a JSON document describing the imaged disks, their
//! partitions and filesystems, plus the compression/encryption parameters
//! needed to decode the block records that follow. The engine treats
//! partition contents as opaque block ranges; the filesystem and file-history
//! records are auxiliary data carried through untouched.

use crate::types::{
    CompressionLevel, CompressionMethod, DiskFormat, EncryptionStrength, FileSystemType,
    KeyDerivation, MediaType, PartitionKind,
};
use serde::{Deserialize, Serialize};

/// Geometry of one partition, byte offsets relative to the start of the disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionGeometry {
    pub start: u64,
    pub end: u64,
    pub length: u64,
    pub boot_sector_offset: u64,
}

/// Auxiliary per-file record attached to a partition. Opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHistory {
    pub file_name: String,
    pub file_number: i32,
}

/// Filesystem descriptor, carried for reporting only; the engine never
/// interprets filesystem structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystem {
    #[serde(rename = "type")]
    pub fs_type: FileSystemType,
    pub volume_label: String,
    pub volume_guid: String,
    pub start: u64,
    pub end: u64,
    pub sectors_per_cluster: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self {
            fs_type: FileSystemType::Unknown,
            volume_label: String::new(),
            volume_guid: String::new(),
            start: 0,
            end: 0,
            sectors_per_cluster: 0,
            total_clusters: 0,
            free_clusters: 0,
        }
    }
}

/// Per-partition bookkeeping: how many logical blocks the partition spans and
/// how large each block is. `block_size` is the unit every block index in the
/// container addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionHeader {
    pub partition_number: i32,
    pub block_count: u32,
    pub block_size: u32,
    #[serde(default)]
    pub file_history: Vec<FileHistory>,
}

/// One imaged partition: table entry data, geometry, filesystem descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLayout {
    pub header: PartitionHeader,
    pub geometry: PartitionGeometry,
    pub kind: PartitionKind,
    pub type_byte: u8,
    pub bootable: bool,
    pub file_system: FileSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskGeometry {
    pub bytes_per_sector: u32,
    pub cylinders: u64,
    pub sectors_per_track: u32,
    pub tracks_per_cylinder: u32,
    pub disk_size: u64,
    pub media_type: MediaType,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self {
            bytes_per_sector: 512,
            cylinders: 0,
            sectors_per_track: 0,
            tracks_per_cylinder: 0,
            disk_size: 0,
            media_type: MediaType::FixedMedia,
        }
    }
}

/// Normalized layout of one imaged disk, produced by the topology parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskLayout {
    pub disk_number: i32,
    pub disk_format: DiskFormat,
    pub disk_signature: String,
    pub geometry: DiskGeometry,
    pub partitions: Vec<PartitionLayout>,
}

/// Compression parameters for the block records of this container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionParams {
    pub method: CompressionMethod,
    pub level: CompressionLevel,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self { method: CompressionMethod::Zstd, level: CompressionLevel::Medium }
    }
}

/// Encryption parameters for the block records of this container.
///
/// `key_check` is BLAKE3 of the derived key, stored so a wrong password is
/// reported as such before any block is touched. The session nonce feeds the
/// per-block IV; it is generated once per file and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub strength: EncryptionStrength,
    pub key_derivation: Option<KeyDerivation>,
    #[serde(default, with = "hex_bytes")]
    pub session_nonce: Vec<u8>,
    #[serde(default, with = "hex_bytes")]
    pub key_check: Vec<u8>,
}

impl Default for EncryptionParams {
    fn default() -> Self {
        Self {
            strength: EncryptionStrength::None,
            key_derivation: None,
            session_nonce: Vec::new(),
            key_check: Vec::new(),
        }
    }
}

/// Free-form auxiliary data attached to a definition; never interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuxiliaryData {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub source_host: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub boot_partition: String,
    #[serde(default)]
    pub system_partition: String,
}

/// The complete layout snapshot of one backup definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLayout {
    pub disks: Vec<DiskLayout>,
    pub compression: CompressionParams,
    pub encryption: EncryptionParams,
    #[serde(default)]
    pub auxiliary: AuxiliaryData,
}

impl FileLayout {
    pub fn new(disks: Vec<DiskLayout>) -> Self {
        Self {
            disks,
            compression: CompressionParams::default(),
            encryption: EncryptionParams::default(),
            auxiliary: AuxiliaryData::default(),
        }
    }
}

/// Hex-string serde for binary fields embedded in the JSON snapshot.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_json_roundtrip() {
        let layout = FileLayout {
            disks: vec![DiskLayout {
                disk_number: 0,
                disk_format: DiskFormat::Gpt,
                disk_signature: "0x1B2C3D4E".to_string(),
                geometry: DiskGeometry::default(),
                partitions: vec![PartitionLayout {
                    header: PartitionHeader {
                        partition_number: 1,
                        block_count: 100,
                        block_size: 1 << 16,
                        file_history: vec![],
                    },
                    geometry: PartitionGeometry {
                        start: 1 << 20,
                        end: 1 << 30,
                        length: (1 << 30) - (1 << 20),
                        boot_sector_offset: 1 << 20,
                    },
                    kind: PartitionKind::Primary,
                    type_byte: 0x07,
                    bootable: true,
                    file_system: FileSystem { fs_type: FileSystemType::Ntfs, ..Default::default() },
                }],
            }],
            compression: CompressionParams::default(),
            encryption: EncryptionParams {
                strength: EncryptionStrength::High,
                key_derivation: Some(KeyDerivation::PasswordBased {
                    iterations: 3,
                    salt: vec![1, 2, 3, 4],
                }),
                session_nonce: vec![9; 8],
                key_check: vec![7; 32],
            },
            auxiliary: AuxiliaryData { comment: "weekly".into(), ..Default::default() },
        };

        let json = serde_json::to_string(&layout).unwrap();
        let back: FileLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back.disks[0].partitions[0].file_system.fs_type, FileSystemType::Ntfs);
        assert_eq!(back.encryption.session_nonce, vec![9; 8]);
        assert_eq!(back.compression.level, CompressionLevel::Medium);
        assert!(json.contains("\"aes-256\""));
    }
}
