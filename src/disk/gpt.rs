//! GPT header and entry-array parsing with CRC32 validation.
//!
//! Field layout follows the EFI specification: the primary header lives at
//! LBA 1, the entry array at `partition_entry_lba`. Both carry CRC32s that
//! must hold before any field is trusted. Parsed structures re-emit
//! byte-exactly (reserved tail included).

use super::{PartitionTableError, SectorSource, SECTOR_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// "EFI PART", little-endian.
pub const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645;
pub const GPT_PRIMARY_LBA: u64 = 1;
pub const GPT_ENTRY_SIZE: usize = 128;
/// Fixed portion of the header; `header_size` may not be smaller.
pub const GPT_HEADER_FIXED_SIZE: u32 = 92;
/// Upper bound on `num_partition_entries` accepted before the table is
/// treated as malformed.
pub const GPT_MAX_ENTRIES: u32 = 4096;

/// Mixed-endian EFI GUID (data1-3 little-endian, data4 raw).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Self {
            data1: LittleEndian::read_u32(&bytes[0..4]),
            data2: LittleEndian::read_u16(&bytes[4..6]),
            data3: LittleEndian::read_u16(&bytes[6..8]),
            data4,
        }
    }

    pub fn emit(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.data1);
        LittleEndian::write_u16(&mut out[4..6], self.data2);
        LittleEndian::write_u16(&mut out[6..8], self.data3);
        out[8..16].copy_from_slice(&self.data4);
    }

    pub fn is_nil(&self) -> bool {
        self.data1 == 0 && self.data2 == 0 && self.data3 == 0 && self.data4 == [0u8; 8]
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

/// GPT entry attribute bitset: bit 0 = required to function, bits 48-63 are
/// type-GUID specific, the rest reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GptEntryAttributes(pub u64);

impl GptEntryAttributes {
    pub fn required_to_function(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn type_guid_specific(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub sizeof_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
    /// Reserved tail of the header sector, preserved for round-tripping.
    pub reserved: Vec<u8>,
}

impl GptHeader {
    /// Parse and validate a GPT header sector. The signature, size bounds and
    /// header CRC32 are all checked before the struct is returned.
    pub fn parse(sector: &[u8], lba: u64) -> Result<Self, PartitionTableError> {
        if sector.len() < SECTOR_SIZE {
            return Err(PartitionTableError::Truncated { need: SECTOR_SIZE, have: sector.len() });
        }
        let signature = LittleEndian::read_u64(&sector[0..8]);
        if signature != GPT_SIGNATURE {
            return Err(PartitionTableError::BadGptSignature { lba });
        }
        let header_size = LittleEndian::read_u32(&sector[12..16]);
        if header_size < GPT_HEADER_FIXED_SIZE || header_size as usize > SECTOR_SIZE {
            return Err(PartitionTableError::BadGptHeaderSize { size: header_size });
        }

        // The stored header CRC32 is computed with its own field zeroed.
        let stored_crc = LittleEndian::read_u32(&sector[16..20]);
        let mut scratch = sector[..header_size as usize].to_vec();
        scratch[16..20].fill(0);
        let computed_crc = crc32fast::hash(&scratch);
        if computed_crc != stored_crc {
            return Err(PartitionTableError::HeaderCrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }

        Ok(Self {
            signature,
            revision: LittleEndian::read_u32(&sector[8..12]),
            header_size,
            header_crc32: stored_crc,
            my_lba: LittleEndian::read_u64(&sector[24..32]),
            alternate_lba: LittleEndian::read_u64(&sector[32..40]),
            first_usable_lba: LittleEndian::read_u64(&sector[40..48]),
            last_usable_lba: LittleEndian::read_u64(&sector[48..56]),
            disk_guid: Guid::parse(&sector[56..72]),
            partition_entry_lba: LittleEndian::read_u64(&sector[72..80]),
            num_partition_entries: LittleEndian::read_u32(&sector[80..84]),
            sizeof_partition_entry: LittleEndian::read_u32(&sector[84..88]),
            partition_entry_array_crc32: LittleEndian::read_u32(&sector[88..92]),
            reserved: sector[header_size as usize..SECTOR_SIZE].to_vec(),
        })
    }

    /// Re-emit the header sector byte-exactly (CRC field as stored).
    pub fn emit(&self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        LittleEndian::write_u64(&mut sector[0..8], self.signature);
        LittleEndian::write_u32(&mut sector[8..12], self.revision);
        LittleEndian::write_u32(&mut sector[12..16], self.header_size);
        LittleEndian::write_u32(&mut sector[16..20], self.header_crc32);
        LittleEndian::write_u64(&mut sector[24..32], self.my_lba);
        LittleEndian::write_u64(&mut sector[32..40], self.alternate_lba);
        LittleEndian::write_u64(&mut sector[40..48], self.first_usable_lba);
        LittleEndian::write_u64(&mut sector[48..56], self.last_usable_lba);
        self.disk_guid.emit(&mut sector[56..72]);
        LittleEndian::write_u64(&mut sector[72..80], self.partition_entry_lba);
        LittleEndian::write_u32(&mut sector[80..84], self.num_partition_entries);
        LittleEndian::write_u32(&mut sector[84..88], self.sizeof_partition_entry);
        LittleEndian::write_u32(&mut sector[88..92], self.partition_entry_array_crc32);
        sector[self.header_size as usize..].copy_from_slice(&self.reserved);
        sector
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub partition_type_guid: Guid,
    pub unique_partition_guid: Guid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: GptEntryAttributes,
    /// UTF-16LE code units of the partition name (36 slots, NUL padded).
    pub partition_name: [u16; 36],
}

impl GptEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, PartitionTableError> {
        if bytes.len() < GPT_ENTRY_SIZE {
            return Err(PartitionTableError::Truncated { need: GPT_ENTRY_SIZE, have: bytes.len() });
        }
        let mut partition_name = [0u16; 36];
        for (i, unit) in partition_name.iter_mut().enumerate() {
            *unit = LittleEndian::read_u16(&bytes[56 + i * 2..58 + i * 2]);
        }
        Ok(Self {
            partition_type_guid: Guid::parse(&bytes[0..16]),
            unique_partition_guid: Guid::parse(&bytes[16..32]),
            starting_lba: LittleEndian::read_u64(&bytes[32..40]),
            ending_lba: LittleEndian::read_u64(&bytes[40..48]),
            attributes: GptEntryAttributes(LittleEndian::read_u64(&bytes[48..56])),
            partition_name,
        })
    }

    pub fn emit(&self, out: &mut [u8]) {
        self.partition_type_guid.emit(&mut out[0..16]);
        self.unique_partition_guid.emit(&mut out[16..32]);
        LittleEndian::write_u64(&mut out[32..40], self.starting_lba);
        LittleEndian::write_u64(&mut out[40..48], self.ending_lba);
        LittleEndian::write_u64(&mut out[48..56], self.attributes.0);
        for (i, unit) in self.partition_name.iter().enumerate() {
            LittleEndian::write_u16(&mut out[56 + i * 2..58 + i * 2], *unit);
        }
    }

    pub fn is_used(&self) -> bool {
        !self.partition_type_guid.is_nil()
    }

    /// Partition name decoded from UTF-16, NUL padding stripped.
    pub fn name(&self) -> String {
        let len = self.partition_name.iter().position(|&u| u == 0).unwrap_or(36);
        String::from_utf16_lossy(&self.partition_name[..len])
    }
}

/// Read and validate the primary GPT (header at LBA 1 plus its entry array).
pub fn read_gpt(
    source: &mut impl SectorSource,
) -> Result<(GptHeader, Vec<GptEntry>), PartitionTableError> {
    let total = source.total_sectors();
    let header_sector = source.read_sector(GPT_PRIMARY_LBA)?;
    let header = GptHeader::parse(&header_sector, GPT_PRIMARY_LBA)?;

    if header.num_partition_entries > GPT_MAX_ENTRIES
        || header.sizeof_partition_entry < GPT_ENTRY_SIZE as u32
        || header.sizeof_partition_entry % 8 != 0
    {
        return Err(PartitionTableError::BadEntryGeometry {
            entries: header.num_partition_entries,
            entry_size: header.sizeof_partition_entry,
        });
    }

    let array_bytes = header.num_partition_entries as u64 * header.sizeof_partition_entry as u64;
    let array_sectors = array_bytes.div_ceil(SECTOR_SIZE as u64);
    let first = header.partition_entry_lba;
    let array_end = first
        .checked_add(array_sectors)
        .ok_or(PartitionTableError::OffsetOutOfBounds { lba: first, total_sectors: total })?;
    if first == 0 || array_end > total {
        return Err(PartitionTableError::OffsetOutOfBounds { lba: first, total_sectors: total });
    }

    let mut raw = Vec::with_capacity((array_sectors as usize) * SECTOR_SIZE);
    for lba in first..first + array_sectors {
        raw.extend_from_slice(&source.read_sector(lba)?);
    }
    raw.truncate(array_bytes as usize);

    let computed_crc = crc32fast::hash(&raw);
    if computed_crc != header.partition_entry_array_crc32 {
        return Err(PartitionTableError::EntryArrayCrcMismatch {
            stored: header.partition_entry_array_crc32,
            computed: computed_crc,
        });
    }

    let entry_size = header.sizeof_partition_entry as usize;
    let mut entries = Vec::with_capacity(header.num_partition_entries as usize);
    for i in 0..header.num_partition_entries as usize {
        entries.push(GptEntry::parse(&raw[i * entry_size..i * entry_size + GPT_ENTRY_SIZE])?);
    }

    // Extents of used entries must lie on the disk.
    for entry in entries.iter().filter(|e| e.is_used()) {
        let end = entry.ending_lba.checked_add(1).ok_or(
            PartitionTableError::OffsetOutOfBounds { lba: entry.ending_lba, total_sectors: total },
        )?;
        if entry.starting_lba == 0 || entry.starting_lba > entry.ending_lba || end > total {
            return Err(PartitionTableError::OffsetOutOfBounds {
                lba: entry.ending_lba,
                total_sectors: total,
            });
        }
    }

    Ok((header, entries))
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// Build a minimal valid GPT disk image: protective MBR, primary header
    /// at LBA 1, entry array at LBA 2, with the given `(start, end)` LBA
    /// partitions.
    pub fn build_gpt_image(num_entries: u32, parts: &[(u64, u64)]) -> Vec<u8> {
        let array_bytes = num_entries as usize * GPT_ENTRY_SIZE;
        let array_sectors = array_bytes.div_ceil(SECTOR_SIZE);
        let total_sectors = 2 + array_sectors + 4096;
        let mut image = vec![0u8; total_sectors * SECTOR_SIZE];

        // Protective MBR: single 0xEE entry spanning the disk.
        image[446 + 4] = super::super::TYPE_GPT_PROTECTIVE;
        LittleEndian::write_u32(&mut image[446 + 8..446 + 12], 1);
        LittleEndian::write_u32(&mut image[446 + 12..446 + 16], (total_sectors - 1) as u32);
        LittleEndian::write_u16(&mut image[510..512], 0xAA55);

        // Entry array at LBA 2.
        let array_at = 2 * SECTOR_SIZE;
        for (i, &(start, end)) in parts.iter().enumerate() {
            let entry = GptEntry {
                partition_type_guid: Guid {
                    data1: 0xEBD0_A0A2,
                    data2: 0xB9E5,
                    data3: 0x4433,
                    data4: [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
                },
                unique_partition_guid: Guid { data1: i as u32 + 1, ..Guid::default() },
                starting_lba: start,
                ending_lba: end,
                attributes: GptEntryAttributes(0),
                partition_name: {
                    let mut name = [0u16; 36];
                    for (j, c) in "data".encode_utf16().enumerate() {
                        name[j] = c;
                    }
                    name
                },
            };
            entry.emit(&mut image[array_at + i * GPT_ENTRY_SIZE..array_at + (i + 1) * GPT_ENTRY_SIZE]);
        }
        let array_crc = crc32fast::hash(&image[array_at..array_at + array_bytes]);

        // Primary header at LBA 1.
        let h = SECTOR_SIZE;
        LittleEndian::write_u64(&mut image[h..h + 8], GPT_SIGNATURE);
        LittleEndian::write_u32(&mut image[h + 8..h + 12], 0x0001_0000);
        LittleEndian::write_u32(&mut image[h + 12..h + 16], GPT_HEADER_FIXED_SIZE);
        LittleEndian::write_u64(&mut image[h + 24..h + 32], GPT_PRIMARY_LBA);
        LittleEndian::write_u64(&mut image[h + 32..h + 40], (total_sectors - 1) as u64);
        LittleEndian::write_u64(&mut image[h + 40..h + 48], (2 + array_sectors) as u64);
        LittleEndian::write_u64(&mut image[h + 48..h + 56], (total_sectors - 2) as u64);
        Guid { data1: 0xDEAD_BEEF, ..Guid::default() }.emit(&mut image[h + 56..h + 72]);
        LittleEndian::write_u64(&mut image[h + 72..h + 80], 2);
        LittleEndian::write_u32(&mut image[h + 80..h + 84], num_entries);
        LittleEndian::write_u32(&mut image[h + 84..h + 88], GPT_ENTRY_SIZE as u32);
        LittleEndian::write_u32(&mut image[h + 88..h + 92], array_crc);

        let header_crc = crc32fast::hash(&image[h..h + GPT_HEADER_FIXED_SIZE as usize]);
        LittleEndian::write_u32(&mut image[h + 16..h + 20], header_crc);

        image
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::build_gpt_image;
    use super::*;
    use crate::disk::MemorySectors;
    use byteorder::{ByteOrder, LittleEndian};

    #[test]
    fn gpt_parse_and_reemit() {
        let image = build_gpt_image(128, &[(2048, 4095)]);
        let mut source = MemorySectors { image: &image };
        let (header, entries) = read_gpt(&mut source).unwrap();

        assert_eq!(header.num_partition_entries, 128);
        assert_eq!(entries.iter().filter(|e| e.is_used()).count(), 1);
        assert_eq!(entries[0].name(), "data");
        assert_eq!(entries[0].starting_lba, 2048);

        // Header round-trip is byte-exact.
        assert_eq!(header.emit().as_slice(), &image[SECTOR_SIZE..2 * SECTOR_SIZE]);

        // Entry round-trip is byte-exact.
        let mut out = [0u8; GPT_ENTRY_SIZE];
        entries[0].emit(&mut out);
        assert_eq!(&out[..], &image[2 * SECTOR_SIZE..2 * SECTOR_SIZE + GPT_ENTRY_SIZE]);
    }

    #[test]
    fn corrupted_header_crc_rejected() {
        let mut image = build_gpt_image(128, &[(2048, 409600)]);
        image[SECTOR_SIZE + 40] ^= 0xFF; // flip a byte inside first_usable_lba
        let mut source = MemorySectors { image: &image };
        assert!(matches!(
            read_gpt(&mut source),
            Err(PartitionTableError::HeaderCrcMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_entry_array_crc_rejected() {
        let mut image = build_gpt_image(128, &[(2048, 409600)]);
        image[2 * SECTOR_SIZE + 32] ^= 0x01; // flip a bit of entry 0's starting LBA
        let mut source = MemorySectors { image: &image };
        assert!(matches!(
            read_gpt(&mut source),
            Err(PartitionTableError::EntryArrayCrcMismatch { .. })
        ));
    }

    #[test]
    fn entry_lba_out_of_bounds_rejected() {
        let image = build_gpt_image(128, &[(2048, 4095)]);
        // Truncate the image so the entry array now falls outside the disk.
        let truncated = &image[..3 * SECTOR_SIZE];
        let mut source = MemorySectors { image: truncated };
        assert!(matches!(
            read_gpt(&mut source),
            Err(PartitionTableError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn entry_lba_near_u64_max_rejected() {
        let mut image = build_gpt_image(128, &[(2048, 4095)]);
        // Point the entry array near the end of the address space and
        // re-seal the header CRC so only the bounds check can reject it.
        let h = SECTOR_SIZE;
        LittleEndian::write_u64(&mut image[h + 72..h + 80], u64::MAX - 1);
        image[h + 16..h + 20].fill(0);
        let crc = crc32fast::hash(&image[h..h + GPT_HEADER_FIXED_SIZE as usize]);
        LittleEndian::write_u32(&mut image[h + 16..h + 20], crc);

        let mut source = MemorySectors { image: &image };
        assert!(matches!(
            read_gpt(&mut source),
            Err(PartitionTableError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn partition_extent_beyond_disk_rejected() {
        // The builder's disk is a few thousand sectors; this partition ends
        // far past it.
        let image = build_gpt_image(128, &[(2048, 409600)]);
        let mut source = MemorySectors { image: &image };
        assert!(matches!(
            read_gpt(&mut source),
            Err(PartitionTableError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn guid_display_is_mixed_endian() {
        let g = Guid {
            data1: 0xC12A7328,
            data2: 0xF81F,
            data3: 0x11D2,
            data4: [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B],
        };
        assert_eq!(g.to_string(), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
    }
}
