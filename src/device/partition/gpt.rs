//! GPT (GUID Partition Table) decoding (§4.3).

use alloc::vec::Vec;

use super::{Partition, PartitionKind};
use crate::device::partition::mbr;
use crate::error::IoError;

const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const HEADER_LBA: u64 = 1;
const PROTECTIVE_MBR_TYPE: u8 = 0xEE;

/// Decodes a GPT partition table.
///
/// Validates the protective MBR (a single partition of type `0xEE`) before
/// trusting the GPT header at LBA 1; entries whose type GUID is all zeros
/// are unused slots and are skipped.
///
/// # Errors
///
/// `CorruptFs` if the protective MBR or the GPT header/signature don't
/// check out, or if an entry's LBA range falls outside the disk.
pub fn decode(
    mut read_sector: impl FnMut(u64) -> Result<[u8; 512], IoError>,
    disk_sectors: u64,
) -> Result<Vec<Partition>, IoError> {
    let mbr_sector = read_sector(0)?;
    if !has_protective_entry(&mbr_sector) {
        return Err(IoError::CorruptFs);
    }

    let header_sector = read_sector(HEADER_LBA)?;
    let header = GptHeader::parse(&header_sector)?;

    let entries_per_sector = 512 / header.entry_size as usize;
    let sectors_needed = header.num_entries as usize / entries_per_sector.max(1) + 1;

    let mut entries_bytes = Vec::with_capacity(sectors_needed * 512);
    for i in 0..sectors_needed as u64 {
        entries_bytes.extend_from_slice(&read_sector(header.entries_lba + i)?);
    }

    let mut partitions = Vec::new();
    for i in 0..header.num_entries as usize {
        let base = i * header.entry_size as usize;
        if base + 128 > entries_bytes.len() {
            break;
        }
        let entry = &entries_bytes[base..base + header.entry_size as usize];
        let type_guid: [u8; 16] = entry[0..16].try_into().unwrap();
        if type_guid == [0u8; 16] {
            continue;
        }
        let start_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let end_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());
        if end_lba < start_lba || end_lba >= disk_sectors {
            continue;
        }
        partitions.push(Partition {
            index: u32::try_from(i + 1).unwrap(),
            start_lba,
            sector_count: end_lba - start_lba + 1,
            kind: PartitionKind::Gpt { type_guid },
        });
    }

    Ok(partitions)
}

fn has_protective_entry(mbr_sector: &[u8; 512]) -> bool {
    const PARTITION_TABLE_OFFSET: usize = 0x1BE;
    const SIGNATURE_OFFSET: usize = 0x1FE;
    if mbr_sector[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
        return false;
    }
    mbr_sector[PARTITION_TABLE_OFFSET + 4] == PROTECTIVE_MBR_TYPE
}

struct GptHeader {
    entries_lba: u64,
    num_entries: u32,
    entry_size: u32,
}

impl GptHeader {
    fn parse(sector: &[u8; 512]) -> Result<Self, IoError> {
        if sector[0..8] != GPT_SIGNATURE {
            return Err(IoError::CorruptFs);
        }
        let entries_lba = u64::from_le_bytes(sector[72..80].try_into().unwrap());
        let num_entries = u32::from_le_bytes(sector[80..84].try_into().unwrap());
        let entry_size = u32::from_le_bytes(sector[84..88].try_into().unwrap());
        if entry_size == 0 || entry_size % 8 != 0 {
            return Err(IoError::CorruptFs);
        }
        Ok(Self {
            entries_lba,
            num_entries,
            entry_size,
        })
    }
}

/// Loads a GPT table, falling back to the MBR decoder when no protective
/// MBR/GPT signature is present, since some disks legitimately use plain MBR.
pub fn decode_or_mbr(
    mut read_sector: impl FnMut(u64) -> Result<[u8; 512], IoError>,
    disk_sectors: u64,
) -> Result<Vec<Partition>, IoError> {
    match decode(&mut read_sector, disk_sectors) {
        Ok(parts) => Ok(parts),
        Err(IoError::CorruptFs) => mbr::decode(read_sector, disk_sectors),
        Err(e) => Err(e),
    }
}
