//! Journal entry framing.
//!
//! Every committed write transaction becomes one entry: a 64-byte header
//! followed by the payload (dirty page images plus freed page numbers),
//! optionally zstd-compressed, with the whole entry padded out to 4KB
//! blocks. Header and payload carry independent xxh3 checksums so replay
//! can tell a torn tail from a valid entry without guessing.
//!
//! Header layout (little-endian):
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 4    | magic              |
//! | 4      | 4    | flags              |
//! | 8      | 8    | transaction id     |
//! | 16     | 4    | page count         |
//! | 20     | 4    | freed count        |
//! | 24     | 4    | payload length     |
//! | 28     | 4    | uncompressed length|
//! | 32     | 8    | catalog root       |
//! | 40     | 8    | next-page watermark|
//! | 48     | 8    | payload checksum   |
//! | 56     | 8    | header checksum    |

use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{PageId, Result, TxId};

/// Magic tag at the start of every journal entry ("VLMJ").
pub const ENTRY_MAGIC: u32 = 0x4A4D_4C56;

/// Size of the fixed entry header.
pub const ENTRY_HEADER_SIZE: usize = 64;

/// Journal addressing granularity in bytes.
pub const BLOCK_SIZE: usize = 4096;

const FLAG_COMPRESSED: u32 = 0b1;

const CHECKSUMMED_HEADER_LEN: usize = 56;

/// Decoded journal entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Id of the committed transaction.
    pub tx_id: TxId,
    /// Whether the payload bytes are zstd-compressed.
    pub compressed: bool,
    /// Number of page images in the payload.
    pub page_count: u32,
    /// Number of freed page numbers in the payload.
    pub freed_count: u32,
    /// Payload length as stored on disk.
    pub payload_len: u32,
    /// Payload length after decompression.
    pub uncompressed_len: u32,
    /// Catalog tree root as of this commit.
    pub catalog_root: PageId,
    /// Page allocation watermark as of this commit.
    pub next_page: PageId,
    /// xxh3 of the on-disk payload bytes.
    pub payload_checksum: u64,
}

impl EntryHeader {
    /// Serializes the header, computing its trailing checksum.
    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], ENTRY_MAGIC);
        let flags = if self.compressed { FLAG_COMPRESSED } else { 0 };
        LittleEndian::write_u32(&mut buf[4..8], flags);
        LittleEndian::write_u64(&mut buf[8..16], self.tx_id);
        LittleEndian::write_u32(&mut buf[16..20], self.page_count);
        LittleEndian::write_u32(&mut buf[20..24], self.freed_count);
        LittleEndian::write_u32(&mut buf[24..28], self.payload_len);
        LittleEndian::write_u32(&mut buf[28..32], self.uncompressed_len);
        LittleEndian::write_u64(&mut buf[32..40], self.catalog_root);
        LittleEndian::write_u64(&mut buf[40..48], self.next_page);
        LittleEndian::write_u64(&mut buf[48..56], self.payload_checksum);
        let checksum = xxh3_64(&buf[..CHECKSUMMED_HEADER_LEN]);
        LittleEndian::write_u64(&mut buf[56..64], checksum);
        buf
    }

    /// Decodes and validates a header. `None` means "not a valid entry"
    /// (zeroed tail, torn write, or corruption) and replay stops there.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        if LittleEndian::read_u32(&buf[0..4]) != ENTRY_MAGIC {
            return None;
        }
        let stored = LittleEndian::read_u64(&buf[56..64]);
        if xxh3_64(&buf[..CHECKSUMMED_HEADER_LEN]) != stored {
            return None;
        }
        let flags = LittleEndian::read_u32(&buf[4..8]);
        Some(Self {
            tx_id: LittleEndian::read_u64(&buf[8..16]),
            compressed: flags & FLAG_COMPRESSED != 0,
            page_count: LittleEndian::read_u32(&buf[16..20]),
            freed_count: LittleEndian::read_u32(&buf[20..24]),
            payload_len: LittleEndian::read_u32(&buf[24..28]),
            uncompressed_len: LittleEndian::read_u32(&buf[28..32]),
            catalog_root: LittleEndian::read_u64(&buf[32..40]),
            next_page: LittleEndian::read_u64(&buf[40..48]),
            payload_checksum: LittleEndian::read_u64(&buf[48..56]),
        })
    }
}

/// A fully framed entry, padded to whole blocks, ready to append.
pub struct SealedEntry {
    /// The header as written at the start of `bytes`.
    pub header: EntryHeader,
    /// Header + payload + zero padding to a block multiple.
    pub bytes: Vec<u8>,
}

impl SealedEntry {
    /// Number of 4KB blocks the entry occupies.
    pub fn blocks(&self) -> u64 {
        (self.bytes.len() / BLOCK_SIZE) as u64
    }
}

/// Frames one transaction: serializes pages and freed numbers, compresses
/// the payload when it exceeds `compress_above`, checksums, and pads.
///
/// # Errors
///
/// Returns an error only if compression itself fails.
pub fn seal(
    tx_id: TxId,
    pages: &[(PageId, Vec<u8>)],
    freed: &[PageId],
    catalog_root: PageId,
    next_page: PageId,
    compress_above: usize,
) -> Result<SealedEntry> {
    let mut raw = Vec::with_capacity(pages.iter().map(|(_, d)| 8 + d.len()).sum::<usize>() + freed.len() * 8);
    for (page_id, data) in pages {
        let mut id_buf = [0u8; 8];
        LittleEndian::write_u64(&mut id_buf, *page_id);
        raw.extend_from_slice(&id_buf);
        raw.extend_from_slice(data);
    }
    for page_id in freed {
        let mut id_buf = [0u8; 8];
        LittleEndian::write_u64(&mut id_buf, *page_id);
        raw.extend_from_slice(&id_buf);
    }

    let uncompressed_len = raw.len() as u32;
    let (payload, compressed) = if raw.len() > compress_above {
        (zstd::stream::encode_all(raw.as_slice(), 3)?, true)
    } else {
        (raw, false)
    };

    let header = EntryHeader {
        tx_id,
        compressed,
        page_count: pages.len() as u32,
        freed_count: freed.len() as u32,
        payload_len: payload.len() as u32,
        uncompressed_len,
        catalog_root,
        next_page,
        payload_checksum: xxh3_64(&payload),
    };

    let total = ENTRY_HEADER_SIZE + payload.len();
    let padded = total.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut bytes = Vec::with_capacity(padded);
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(&payload);
    bytes.resize(padded, 0);

    Ok(SealedEntry { header, bytes })
}

/// Validates and unpacks an entry payload against its header. `None` means
/// the payload does not match the header (replay stops).
pub fn open_payload(
    header: &EntryHeader,
    payload: &[u8],
    page_size: usize,
) -> Option<(Vec<(PageId, Vec<u8>)>, Vec<PageId>)> {
    if payload.len() != header.payload_len as usize {
        return None;
    }
    if xxh3_64(payload) != header.payload_checksum {
        return None;
    }

    let raw = if header.compressed {
        let decoded = zstd::stream::decode_all(payload).ok()?;
        if decoded.len() != header.uncompressed_len as usize {
            return None;
        }
        decoded
    } else {
        payload.to_vec()
    };

    let page_bytes = header.page_count as usize * (8 + page_size);
    let freed_bytes = header.freed_count as usize * 8;
    if raw.len() != page_bytes + freed_bytes {
        return None;
    }

    let mut pages = Vec::with_capacity(header.page_count as usize);
    let mut offset = 0;
    for _ in 0..header.page_count {
        let page_id = LittleEndian::read_u64(&raw[offset..]);
        offset += 8;
        pages.push((page_id, raw[offset..offset + page_size].to_vec()));
        offset += page_size;
    }
    let mut freed = Vec::with_capacity(header.freed_count as usize);
    for _ in 0..header.freed_count {
        freed.push(LittleEndian::read_u64(&raw[offset..]));
        offset += 8;
    }
    Some((pages, freed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    fn sample_pages(count: usize) -> Vec<(PageId, Vec<u8>)> {
        (0..count)
            .map(|i| {
                let mut data = vec![0u8; PAGE_SIZE];
                data[0] = i as u8;
                data[PAGE_SIZE - 1] = 0xFF - i as u8;
                (100 + i as u64, data)
            })
            .collect()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = EntryHeader {
            tx_id: 42,
            compressed: true,
            page_count: 3,
            freed_count: 1,
            payload_len: 999,
            uncompressed_len: 12336,
            catalog_root: 7,
            next_page: 55,
            payload_checksum: 0xDEAD_BEEF,
        };
        let encoded = header.encode();
        assert_eq!(EntryHeader::decode(&encoded), Some(header));
    }

    #[test]
    fn test_header_rejects_corruption() {
        let header = EntryHeader {
            tx_id: 1,
            compressed: false,
            page_count: 0,
            freed_count: 0,
            payload_len: 0,
            uncompressed_len: 0,
            catalog_root: 0,
            next_page: 1,
            payload_checksum: 0,
        };
        let mut encoded = header.encode();
        encoded[9] ^= 0x01;
        assert_eq!(EntryHeader::decode(&encoded), None);

        // Zeroed tail (preallocated journal space) is "no entry" too.
        assert_eq!(EntryHeader::decode(&[0u8; ENTRY_HEADER_SIZE]), None);
    }

    #[test]
    fn test_seal_and_open_uncompressed() {
        let pages = sample_pages(2);
        let freed = vec![900, 901];
        let entry = seal(5, &pages, &freed, 3, 200, usize::MAX).unwrap();
        assert!(!entry.header.compressed);
        assert_eq!(entry.bytes.len() % BLOCK_SIZE, 0);
        assert_eq!(entry.blocks(), 3);

        let payload = &entry.bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + entry.header.payload_len as usize];
        let (got_pages, got_freed) = open_payload(&entry.header, payload, PAGE_SIZE).unwrap();
        assert_eq!(got_pages, pages);
        assert_eq!(got_freed, freed);
    }

    #[test]
    fn test_seal_compresses_above_threshold() {
        let pages = sample_pages(4);
        let entry = seal(9, &pages, &[], 0, 10, 1024).unwrap();
        assert!(entry.header.compressed);
        // Mostly-zero pages compress far below the raw size.
        assert!((entry.header.payload_len as usize) < entry.header.uncompressed_len as usize);

        let payload = &entry.bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + entry.header.payload_len as usize];
        let (got_pages, got_freed) = open_payload(&entry.header, payload, PAGE_SIZE).unwrap();
        assert_eq!(got_pages, pages);
        assert!(got_freed.is_empty());
    }

    #[test]
    fn test_open_payload_rejects_flip() {
        let pages = sample_pages(1);
        let entry = seal(2, &pages, &[], 0, 10, usize::MAX).unwrap();
        let mut payload =
            entry.bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + entry.header.payload_len as usize].to_vec();
        payload[20] ^= 0xFF;
        assert!(open_payload(&entry.header, &payload, PAGE_SIZE).is_none());
    }

    #[test]
    fn test_freed_only_entry() {
        let entry = seal(7, &[], &[11, 12, 13], 0, 20, usize::MAX).unwrap();
        assert_eq!(entry.blocks(), 1);
        let payload = &entry.bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + entry.header.payload_len as usize];
        let (pages, freed) = open_payload(&entry.header, payload, PAGE_SIZE).unwrap();
        assert!(pages.is_empty());
        assert_eq!(freed, vec![11, 12, 13]);
    }
}
