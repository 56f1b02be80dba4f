//! MBR boot record and extended partition chain parsing.
//!
//! Structures are parsed, never mutated; `emit` reproduces the source bytes
//! exactly, including boot code and raw CHS fields.

use super::{PartitionTableError, SectorSource, SECTOR_SIZE, TYPE_EXTENDED, TYPE_EXTENDED_LBA};
use byteorder::{ByteOrder, LittleEndian};

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const BOOT_CODE_LEN: usize = 442;
pub const PARTITION_ENTRY_LEN: usize = 16;
const ENTRY_TABLE_OFFSET: usize = 446;

/// Longest extended-partition chain accepted before the table is treated as
/// malformed (self-referencing EBR links would otherwise loop forever).
const MAX_EXTENDED_CHAIN: usize = 128;

/// One 16-byte partition table entry. CHS fields are kept raw for byte-exact
/// round-tripping; the engine only uses the LBA fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub status: u8,
    pub start_head: u8,
    pub start_sector_cylinder: u16,
    pub partition_type: u8,
    pub end_head: u8,
    pub end_sector_cylinder: u16,
    /// Start LBA, relative to the containing table.
    pub boot_sector_offset: u32,
    pub num_sectors: u32,
}

impl PartitionEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, PartitionTableError> {
        if bytes.len() < PARTITION_ENTRY_LEN {
            return Err(PartitionTableError::Truncated {
                need: PARTITION_ENTRY_LEN,
                have: bytes.len(),
            });
        }
        Ok(Self {
            status: bytes[0],
            start_head: bytes[1],
            start_sector_cylinder: LittleEndian::read_u16(&bytes[2..4]),
            partition_type: bytes[4],
            end_head: bytes[5],
            end_sector_cylinder: LittleEndian::read_u16(&bytes[6..8]),
            boot_sector_offset: LittleEndian::read_u32(&bytes[8..12]),
            num_sectors: LittleEndian::read_u32(&bytes[12..16]),
        })
    }

    pub fn emit(&self, out: &mut [u8]) {
        out[0] = self.status;
        out[1] = self.start_head;
        LittleEndian::write_u16(&mut out[2..4], self.start_sector_cylinder);
        out[4] = self.partition_type;
        out[5] = self.end_head;
        LittleEndian::write_u16(&mut out[6..8], self.end_sector_cylinder);
        LittleEndian::write_u32(&mut out[8..12], self.boot_sector_offset);
        LittleEndian::write_u32(&mut out[12..16], self.num_sectors);
    }

    pub fn is_used(&self) -> bool {
        self.partition_type != 0 && self.num_sectors != 0
    }

    pub fn is_active(&self) -> bool {
        self.status & 0x80 != 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, TYPE_EXTENDED | TYPE_EXTENDED_LBA)
    }
}

/// A complete 512-byte boot record: boot code, disk signature, four partition
/// entries, 0xAA55 id code.
#[derive(Debug, Clone)]
pub struct BootRecord {
    pub boot_code: [u8; BOOT_CODE_LEN],
    pub disk_signature: u32,
    pub entries: [PartitionEntry; 4],
    pub id_code: u16,
}

impl BootRecord {
    /// Parse a boot sector, rejecting anything without the 0xAA55 signature.
    pub fn parse(sector: &[u8]) -> Result<Self, PartitionTableError> {
        if sector.len() < SECTOR_SIZE {
            return Err(PartitionTableError::Truncated { need: SECTOR_SIZE, have: sector.len() });
        }
        let id_code = LittleEndian::read_u16(&sector[510..512]);
        if id_code != MBR_SIGNATURE {
            return Err(PartitionTableError::BadMbrSignature);
        }

        let mut boot_code = [0u8; BOOT_CODE_LEN];
        boot_code.copy_from_slice(&sector[..BOOT_CODE_LEN]);
        let disk_signature = LittleEndian::read_u32(&sector[BOOT_CODE_LEN..ENTRY_TABLE_OFFSET]);

        let mut entries = [PartitionEntry::default(); 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let at = ENTRY_TABLE_OFFSET + i * PARTITION_ENTRY_LEN;
            *entry = PartitionEntry::parse(&sector[at..at + PARTITION_ENTRY_LEN])?;
        }

        Ok(Self { boot_code, disk_signature, entries, id_code })
    }

    /// Re-emit the boot sector byte-exactly.
    pub fn emit(&self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..BOOT_CODE_LEN].copy_from_slice(&self.boot_code);
        LittleEndian::write_u32(&mut sector[BOOT_CODE_LEN..ENTRY_TABLE_OFFSET], self.disk_signature);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = ENTRY_TABLE_OFFSET + i * PARTITION_ENTRY_LEN;
            entry.emit(&mut sector[at..at + PARTITION_ENTRY_LEN]);
        }
        LittleEndian::write_u16(&mut sector[510..512], self.id_code);
        sector
    }

    pub fn used_entries(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|e| e.is_used())
    }

    pub fn has_partition_type(&self, partition_type: u8) -> bool {
        self.used_entries().any(|e| e.partition_type == partition_type)
    }
}

/// One link of an extended partition chain: the EBR's boot record and its
/// absolute LBA on disk.
#[derive(Debug, Clone)]
pub struct ExtendedPartition {
    pub record: BootRecord,
    pub offset_lba: u64,
    pub number: u16,
}

/// Walk the chained extended boot records starting from the MBR's extended
/// container entry. Link entries are relative to the outer extended base;
/// logical entries are relative to their own EBR.
pub fn read_extended_chain(
    source: &mut impl SectorSource,
    boot_record: &BootRecord,
) -> Result<Vec<ExtendedPartition>, PartitionTableError> {
    let container = match boot_record.used_entries().find(|e| e.is_extended()) {
        Some(e) => e,
        None => return Ok(Vec::new()),
    };

    let base_lba = container.boot_sector_offset as u64;
    let total = source.total_sectors();
    let mut chain = Vec::new();
    let mut next_lba = base_lba;
    let mut number: u16 = 0;

    loop {
        if chain.len() >= MAX_EXTENDED_CHAIN {
            return Err(PartitionTableError::ExtendedChainTooLong(MAX_EXTENDED_CHAIN));
        }
        if next_lba >= total {
            return Err(PartitionTableError::OffsetOutOfBounds { lba: next_lba, total_sectors: total });
        }

        let sector = source.read_sector(next_lba)?;
        let record = BootRecord::parse(&sector)?;
        let link = record.used_entries().find(|e| e.is_extended()).copied();
        chain.push(ExtendedPartition { record, offset_lba: next_lba, number });
        number += 1;

        match link {
            Some(entry) => next_lba = base_lba + entry.boot_sector_offset as u64,
            None => break,
        }
    }

    Ok(chain)
}


#[cfg(test)]
mod tests {
    use super::tests_support::build_mbr_sector;
    use super::*;
    use crate::disk::MemorySectors;

    #[test]
    fn boot_record_roundtrip_is_byte_exact() {
        let mut sector = build_mbr_sector(&[(0x80, 0x07, 2048, 4096), (0, 0x83, 8192, 1024)]);
        // Fill boot code with a pattern so a round-trip slip is visible.
        for (i, b) in sector[..BOOT_CODE_LEN].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let record = BootRecord::parse(&sector).unwrap();
        assert_eq!(record.emit(), sector);
        assert_eq!(record.used_entries().count(), 2);
    }

    #[test]
    fn corrupted_signature_byte_rejected() {
        let mut sector = build_mbr_sector(&[(0x80, 0x07, 2048, 4096)]);
        sector[510] = 0x00;
        assert!(matches!(BootRecord::parse(&sector), Err(PartitionTableError::BadMbrSignature)));
    }

    #[test]
    fn extended_chain_walk() {
        // MBR: one primary + one extended container at LBA 16.
        // EBR 0 at LBA 16: logical at +1, link to +8.
        // EBR 1 at LBA 24: logical at +1, no link.
        let mut image = vec![0u8; SECTOR_SIZE * 64];
        let mbr = build_mbr_sector(&[(0x80, 0x07, 2, 8), (0, TYPE_EXTENDED, 16, 32)]);
        image[..SECTOR_SIZE].copy_from_slice(&mbr);

        let ebr0 = build_mbr_sector(&[(0, 0x83, 1, 4), (0, TYPE_EXTENDED, 8, 8)]);
        image[16 * SECTOR_SIZE..17 * SECTOR_SIZE].copy_from_slice(&ebr0);
        let ebr1 = build_mbr_sector(&[(0, 0x83, 1, 4)]);
        image[24 * SECTOR_SIZE..25 * SECTOR_SIZE].copy_from_slice(&ebr1);

        let mut source = MemorySectors { image: &image };
        let record = BootRecord::parse(&image[..SECTOR_SIZE]).unwrap();
        let chain = read_extended_chain(&mut source, &record).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].offset_lba, 16);
        assert_eq!(chain[1].offset_lba, 24);
        assert_eq!(chain[1].number, 1);
    }

    #[test]
    fn extended_link_out_of_bounds_fails() {
        let mut image = vec![0u8; SECTOR_SIZE * 32];
        let mbr = build_mbr_sector(&[(0, TYPE_EXTENDED, 16, 8)]);
        image[..SECTOR_SIZE].copy_from_slice(&mbr);
        let ebr = build_mbr_sector(&[(0, 0x83, 1, 4), (0, TYPE_EXTENDED, 4096, 8)]);
        image[16 * SECTOR_SIZE..17 * SECTOR_SIZE].copy_from_slice(&ebr);

        let mut source = MemorySectors { image: &image };
        let record = BootRecord::parse(&image[..SECTOR_SIZE]).unwrap();
        assert!(matches!(
            read_extended_chain(&mut source, &record),
            Err(PartitionTableError::OffsetOutOfBounds { .. })
        ));
    }
}
