//! Enum catalog shared across the container format and the engine.
//!
//! Every discriminant that appears in the on-disk JSON records uses the
//! snake_case string forms below; binary records never store these enums
//! directly (block headers carry their own numeric fields).

use serde::{Deserialize, Serialize};

/// Kind of backup a definition represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Contains only full data blocks; the root of a set.
    Full,
    /// Blocks changed since the immediate parent definition.
    Incremental,
    /// Blocks changed since the set's root full backup.
    Differential,
    /// Full-equivalent produced by flattening a chain, no source re-read.
    SyntheticFull,
}

impl BackupType {
    /// True for definitions that can serve as a merge target / chain base.
    pub fn is_base(self) -> bool {
        matches!(self, BackupType::Full | BackupType::SyntheticFull)
    }

    pub fn name(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
            BackupType::SyntheticFull => "synthetic_full",
        }
    }
}

/// Partition-table format of an imaged disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    Mbr,
    Gpt,
    Dynamic,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    RemovableMedia,
    FixedMedia,
}

/// Position of a partition within the table structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Unallocated,
    Primary,
    Logical,
}

/// Filesystem occupying a partition. Opaque to the engine; carried for
/// reporting and auxiliary records only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemType {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "NTFS")]
    Ntfs,
    #[serde(rename = "ReFS")]
    Refs,
    #[serde(rename = "exFAT")]
    ExFat,
    #[serde(rename = "FAT32")]
    Fat32,
    #[serde(rename = "FAT16")]
    Fat16,
    #[serde(rename = "FAT12")]
    Fat12,
    #[serde(rename = "ext")]
    LinuxExt,
}

/// Compression method. A single algorithm today; the field exists so a
/// reader can reject a future method it does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    Zstd,
}

/// Per-block compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    None,
    Medium,
    High,
}

impl CompressionLevel {
    /// Wire value stored in the binary block header.
    pub fn to_wire(self) -> u8 {
        match self {
            CompressionLevel::None => 0,
            CompressionLevel::Medium => 1,
            CompressionLevel::High => 2,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionLevel::None),
            1 => Some(CompressionLevel::Medium),
            2 => Some(CompressionLevel::High),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::Medium => "medium",
            CompressionLevel::High => "high",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CompressionLevel::None),
            "medium" => Some(CompressionLevel::Medium),
            "high" => Some(CompressionLevel::High),
            _ => None,
        }
    }
}

/// Cipher strength for per-block encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionStrength {
    #[serde(rename = "none")]
    None,
    /// AES-128-GCM.
    #[serde(rename = "aes-128")]
    Standard,
    /// AES-192-GCM.
    #[serde(rename = "aes-192")]
    Medium,
    /// AES-256-GCM.
    #[serde(rename = "aes-256")]
    High,
}

impl EncryptionStrength {
    pub fn name(self) -> &'static str {
        match self {
            EncryptionStrength::None => "none",
            EncryptionStrength::Standard => "aes-128",
            EncryptionStrength::Medium => "aes-192",
            EncryptionStrength::High => "aes-256",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(EncryptionStrength::None),
            "standard" | "aes-128" => Some(EncryptionStrength::Standard),
            "medium" | "aes-192" => Some(EncryptionStrength::Medium),
            "high" | "aes-256" => Some(EncryptionStrength::High),
            _ => None,
        }
    }

    /// Key length in bytes for this strength.
    pub fn key_len(self) -> usize {
        match self {
            EncryptionStrength::None => 0,
            EncryptionStrength::Standard => 16,
            EncryptionStrength::Medium => 24,
            EncryptionStrength::High => 32,
        }
    }
}

/// Key-derivation method for password-based encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum KeyDerivation {
    PasswordBased { iterations: u32, salt: Vec<u8> },
}

/// Which sub-chain a retention rule governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionType {
    Full,
    Differential,
    Incremental,
}

/// How a retention window is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPeriod {
    Count,
    Days,
    Weeks,
}

/// Rollup cadence applied when a chain falls outside its retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationType {
    None,
    Daily,
    Weekly,
    Monthly,
    SyntheticFull,
    IncrementalMerge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_type_json_names() {
        assert_eq!(serde_json::to_string(&BackupType::SyntheticFull).unwrap(), "\"synthetic_full\"");
        let t: BackupType = serde_json::from_str("\"incremental\"").unwrap();
        assert_eq!(t, BackupType::Incremental);
    }

    #[test]
    fn encryption_strength_wire_names() {
        assert_eq!(serde_json::to_string(&EncryptionStrength::High).unwrap(), "\"aes-256\"");
        assert_eq!(EncryptionStrength::from_name("medium"), Some(EncryptionStrength::Medium));
        assert_eq!(EncryptionStrength::Medium.key_len(), 24);
    }

    #[test]
    fn compression_level_wire_roundtrip() {
        for lvl in [CompressionLevel::None, CompressionLevel::Medium, CompressionLevel::High] {
            assert_eq!(CompressionLevel::from_wire(lvl.to_wire()), Some(lvl));
        }
        assert_eq!(CompressionLevel::from_wire(9), None);
    }
}
