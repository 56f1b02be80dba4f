//! Disk topology parsing: MBR and GPT partition tables.
//!
//! The engine never issues device I/O. Raw sectors are supplied by the host
//! through [`SectorSource`]; parsing validates them (signatures, CRC32s,
//! bounds) and produces a normalized [`DiskLayout`] whose partitions the rest
//! of the engine treats purely as opaque addressable byte ranges.

pub mod gpt;
pub mod mbr;

use crate::layout::{
    DiskGeometry, DiskLayout, FileSystem, PartitionGeometry, PartitionHeader, PartitionLayout,
};
use crate::types::{DiskFormat, MediaType, PartitionKind};
use thiserror::Error;

pub use gpt::{Guid, GptEntry, GptEntryAttributes, GptHeader};
pub use mbr::{BootRecord, ExtendedPartition, PartitionEntry};

pub const SECTOR_SIZE: usize = 512;

/// MBR partition type byte for a GPT protective entry.
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;
/// MBR partition type byte for an EFI system partition.
pub const TYPE_EFI_SYSTEM: u8 = 0xEF;
/// MBR partition type bytes for extended partition containers.
pub const TYPE_EXTENDED: u8 = 0x05;
pub const TYPE_EXTENDED_LBA: u8 = 0x0F;
/// MBR partition type byte for LDM (dynamic disk) metadata.
pub const TYPE_LDM: u8 = 0x42;

#[derive(Error, Debug)]
pub enum PartitionTableError {
    #[error("malformed partition table: boot sector signature is not 0xAA55")]
    BadMbrSignature,
    #[error("malformed partition table: GPT header signature mismatch at LBA {lba}")]
    BadGptSignature { lba: u64 },
    #[error("malformed partition table: GPT header size {size} out of range")]
    BadGptHeaderSize { size: u32 },
    #[error("malformed partition table: GPT header CRC32 mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    HeaderCrcMismatch { stored: u32, computed: u32 },
    #[error("malformed partition table: GPT entry array CRC32 mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    EntryArrayCrcMismatch { stored: u32, computed: u32 },
    #[error("malformed partition table: GPT entry geometry out of range ({entries} entries of {entry_size} bytes)")]
    BadEntryGeometry { entries: u32, entry_size: u32 },
    #[error("malformed partition table: LBA {lba} outside disk bounds ({total_sectors} sectors)")]
    OffsetOutOfBounds { lba: u64, total_sectors: u64 },
    #[error("malformed partition table: extended partition chain exceeds {0} links")]
    ExtendedChainTooLong(usize),
    #[error("truncated sector data: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("sector read failed at LBA {lba}: {reason}")]
    SectorRead { lba: u64, reason: String },
}

/// Raw-sector provider. Implemented by the host's disk access layer; in
/// tests, by an in-memory image.
pub trait SectorSource {
    /// Total addressable sectors on the disk.
    fn total_sectors(&self) -> u64;

    /// Read one 512-byte sector at the given LBA.
    fn read_sector(&mut self, lba: u64) -> Result<[u8; SECTOR_SIZE], PartitionTableError>;
}

/// In-memory [`SectorSource`] over a flat image buffer.
pub struct MemorySectors<'a> {
    pub image: &'a [u8],
}

impl SectorSource for MemorySectors<'_> {
    fn total_sectors(&self) -> u64 {
        (self.image.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, lba: u64) -> Result<[u8; SECTOR_SIZE], PartitionTableError> {
        let start = lba as usize * SECTOR_SIZE;
        let end = start + SECTOR_SIZE;
        if end > self.image.len() {
            return Err(PartitionTableError::OffsetOutOfBounds {
                lba,
                total_sectors: self.total_sectors(),
            });
        }
        let mut sector = [0u8; SECTOR_SIZE];
        sector.copy_from_slice(&self.image[start..end]);
        Ok(sector)
    }
}

/// Fully parsed topology of one disk: classification, raw table structures
/// (kept byte-exact for re-emission) and the normalized partition list.
#[derive(Debug, Clone)]
pub struct DiskTopology {
    pub format: DiskFormat,
    pub boot_record: BootRecord,
    pub extended: Vec<ExtendedPartition>,
    pub gpt_header: Option<GptHeader>,
    pub gpt_entries: Vec<GptEntry>,
    pub total_sectors: u64,
}

impl DiskTopology {
    /// Parse and validate the partition table of a disk.
    ///
    /// Classification order: a protective 0xEE entry routes to GPT parsing
    /// (primary header at LBA 1, entry array validated against its CRC32);
    /// an LDM metadata entry classifies the disk as dynamic; anything else
    /// with at least one used entry is plain MBR, otherwise unknown.
    pub fn read(source: &mut impl SectorSource) -> Result<Self, PartitionTableError> {
        let sector0 = source.read_sector(0)?;
        let boot_record = BootRecord::parse(&sector0)?;

        let total_sectors = source.total_sectors();
        let mut topology = DiskTopology {
            format: DiskFormat::Unknown,
            boot_record,
            extended: Vec::new(),
            gpt_header: None,
            gpt_entries: Vec::new(),
            total_sectors,
        };

        if topology.boot_record.has_partition_type(TYPE_GPT_PROTECTIVE) {
            let (header, entries) = gpt::read_gpt(source)?;
            topology.format = DiskFormat::Gpt;
            topology.gpt_header = Some(header);
            topology.gpt_entries = entries;
            return Ok(topology);
        }

        if topology.boot_record.has_partition_type(TYPE_LDM) {
            topology.format = DiskFormat::Dynamic;
            return Ok(topology);
        }

        if topology.boot_record.used_entries().next().is_none() {
            return Ok(topology); // no table, leave unknown
        }

        topology.format = DiskFormat::Mbr;
        topology.extended = mbr::read_extended_chain(source, &topology.boot_record)?;

        // Extents of addressable partitions must lie on the disk.
        for entry in topology.boot_record.used_entries().filter(|e| !e.is_extended()) {
            check_extent(entry.boot_sector_offset as u64, entry.num_sectors as u64, total_sectors)?;
        }
        for ext in &topology.extended {
            for entry in ext.record.used_entries().filter(|e| !e.is_extended()) {
                check_extent(
                    ext.offset_lba.saturating_add(entry.boot_sector_offset as u64),
                    entry.num_sectors as u64,
                    total_sectors,
                )?;
            }
        }
        Ok(topology)
    }

    /// Normalize into the layout snapshot structure. `block_size` is the
    /// logical backup block size the engine will address partitions by.
    pub fn to_disk_layout(&self, disk_number: i32, block_size: u32) -> DiskLayout {
        let bytes_per_sector = SECTOR_SIZE as u64;
        let mut partitions = Vec::new();
        let mut partition_number = 1;

        match self.format {
            DiskFormat::Gpt => {
                for entry in self.gpt_entries.iter().filter(|e| e.is_used()) {
                    let start = entry.starting_lba.saturating_mul(bytes_per_sector);
                    let end =
                        entry.ending_lba.saturating_add(1).saturating_mul(bytes_per_sector);
                    partitions.push(normalized_partition(
                        partition_number,
                        PartitionKind::Primary,
                        0,
                        entry.attributes.required_to_function(),
                        start,
                        end,
                        block_size,
                    ));
                    partition_number += 1;
                }
            }
            DiskFormat::Mbr => {
                for entry in self.boot_record.used_entries() {
                    if entry.is_extended() {
                        continue; // container slot, not an addressable partition
                    }
                    let start = entry.boot_sector_offset as u64 * bytes_per_sector;
                    let end = start + entry.num_sectors as u64 * bytes_per_sector;
                    partitions.push(normalized_partition(
                        partition_number,
                        PartitionKind::Primary,
                        entry.partition_type,
                        entry.is_active(),
                        start,
                        end,
                        block_size,
                    ));
                    partition_number += 1;
                }
                for ext in &self.extended {
                    for entry in ext.record.used_entries().filter(|e| !e.is_extended()) {
                        let start = ext
                            .offset_lba
                            .saturating_add(entry.boot_sector_offset as u64)
                            .saturating_mul(bytes_per_sector);
                        let end = start.saturating_add(entry.num_sectors as u64 * bytes_per_sector);
                        partitions.push(normalized_partition(
                            partition_number,
                            PartitionKind::Logical,
                            entry.partition_type,
                            entry.is_active(),
                            start,
                            end,
                            block_size,
                        ));
                        partition_number += 1;
                    }
                }
            }
            DiskFormat::Dynamic | DiskFormat::Unknown => {}
        }

        partitions.sort_by_key(|p| p.geometry.start);

        DiskLayout {
            disk_number,
            disk_format: self.format,
            disk_signature: format!("{:#010X}", self.boot_record.disk_signature),
            geometry: DiskGeometry {
                bytes_per_sector: SECTOR_SIZE as u32,
                cylinders: 0,
                sectors_per_track: 0,
                tracks_per_cylinder: 0,
                disk_size: self.total_sectors * bytes_per_sector,
                media_type: MediaType::FixedMedia,
            },
            partitions,
        }
    }
}

fn check_extent(start: u64, sectors: u64, total: u64) -> Result<(), PartitionTableError> {
    match start.checked_add(sectors) {
        Some(end) if end <= total => Ok(()),
        _ => Err(PartitionTableError::OffsetOutOfBounds { lba: start, total_sectors: total }),
    }
}

fn normalized_partition(
    partition_number: i32,
    kind: PartitionKind,
    type_byte: u8,
    bootable: bool,
    start: u64,
    end: u64,
    block_size: u32,
) -> PartitionLayout {
    let length = end.saturating_sub(start);
    let block_count = length.div_ceil(block_size as u64) as u32;
    PartitionLayout {
        header: PartitionHeader {
            partition_number,
            block_count,
            block_size,
            file_history: Vec::new(),
        },
        geometry: PartitionGeometry { start, end, length, boot_sector_offset: start },
        kind,
        type_byte,
        bootable,
        file_system: FileSystem::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::gpt::tests_support::build_gpt_image;
    use crate::disk::mbr::tests_support::build_mbr_sector;

    #[test]
    fn classify_plain_mbr() {
        let sector = build_mbr_sector(&[(0x80, 0x07, 2048, 20480)]);
        let mut image = vec![0u8; SECTOR_SIZE * 32768];
        image[..SECTOR_SIZE].copy_from_slice(&sector);

        let topo = DiskTopology::read(&mut MemorySectors { image: &image }).unwrap();
        assert_eq!(topo.format, DiskFormat::Mbr);

        let layout = topo.to_disk_layout(0, 1 << 16);
        assert_eq!(layout.partitions.len(), 1);
        assert_eq!(layout.partitions[0].geometry.start, 2048 * 512);
        assert!(layout.partitions[0].bootable);
    }

    #[test]
    fn mbr_partition_extent_beyond_disk_rejected() {
        // 20480 sectors declared on a 64 sector disk.
        let sector = build_mbr_sector(&[(0x80, 0x07, 2048, 20480)]);
        let mut image = vec![0u8; SECTOR_SIZE * 64];
        image[..SECTOR_SIZE].copy_from_slice(&sector);

        assert!(matches!(
            DiskTopology::read(&mut MemorySectors { image: &image }),
            Err(PartitionTableError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn classify_dynamic_disk() {
        let sector = build_mbr_sector(&[(0x00, TYPE_LDM, 63, 100000)]);
        let mut image = vec![0u8; SECTOR_SIZE * 8];
        image[..SECTOR_SIZE].copy_from_slice(&sector);

        let topo = DiskTopology::read(&mut MemorySectors { image: &image }).unwrap();
        assert_eq!(topo.format, DiskFormat::Dynamic);
    }

    #[test]
    fn empty_table_is_unknown() {
        let sector = build_mbr_sector(&[]);
        let mut image = vec![0u8; SECTOR_SIZE * 8];
        image[..SECTOR_SIZE].copy_from_slice(&sector);

        let topo = DiskTopology::read(&mut MemorySectors { image: &image }).unwrap();
        assert_eq!(topo.format, DiskFormat::Unknown);
        assert!(topo.to_disk_layout(0, 1 << 16).partitions.is_empty());
    }

    #[test]
    fn classify_gpt_and_normalize() {
        let image = build_gpt_image(128, &[(2048, 2999), (3072, 4095)]);
        let topo = DiskTopology::read(&mut MemorySectors { image: &image }).unwrap();
        assert_eq!(topo.format, DiskFormat::Gpt);
        assert_eq!(topo.gpt_entries.iter().filter(|e| e.is_used()).count(), 2);

        let layout = topo.to_disk_layout(0, 1 << 16);
        assert_eq!(layout.partitions.len(), 2);
        assert_eq!(layout.partitions[0].geometry.start, 2048 * 512);
        assert_eq!(layout.partitions[1].kind, PartitionKind::Primary);
    }
}
