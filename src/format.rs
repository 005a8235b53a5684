//! On-disk structures of the WIA/RVZ container format.
//!
//! All integers are big-endian and all structs are packed without padding.
//! Sizes are fixed by the format and asserted at compile time.

use std::{fmt, mem::size_of};

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{Compression, DiscKind, HashBytes, KeyBytes, MagicBytes},
    util::static_assert,
    Error, Result,
};

/// Magic bytes identifying a WIA container.
pub const WIA_MAGIC: MagicBytes = *b"WIA\x01";
/// Magic bytes identifying an RVZ container.
pub const RVZ_MAGIC: MagicBytes = *b"RVZ\x01";

/// WIA version written by this crate.
pub const WIA_VERSION: u32 = 0x01000000;
/// Oldest WIA version able to read files written by this crate.
pub const WIA_VERSION_WRITE_COMPATIBLE: u32 = 0x01000000;
/// Oldest WIA version this crate can read.
pub const WIA_VERSION_READ_COMPATIBLE: u32 = 0x00080000;

/// RVZ version written by this crate.
pub const RVZ_VERSION: u32 = 0x01000000;
/// Oldest RVZ version able to read files written by this crate.
pub const RVZ_VERSION_WRITE_COMPATIBLE: u32 = 0x00030000;
/// Oldest RVZ version this crate can read.
pub const RVZ_VERSION_READ_COMPATIBLE: u32 = 0x00030000;

/// Size in bytes of a disc sector. (32 KiB)
pub const SECTOR_SIZE: usize = 0x8000;

/// Size in bytes of a Wii sector group. (64 sectors, 2 MiB)
pub const SECTOR_GROUP_SIZE: usize = SECTOR_SIZE * 64;

/// Number of bytes of the disc image stored directly in [`DiscInfo`].
pub const DISC_HEAD_SIZE: usize = 0x80;

/// Formats a four-byte version number as `A.BB.CC`.
pub fn version_display(version: u32) -> impl fmt::Display {
    struct Version(u32);
    impl fmt::Display for Version {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let [a, b, c, _] = self.0.to_be_bytes();
            write!(f, "{:x}.{:02x}.{:02x}", a, b, c)
        }
    }
    Version(version)
}

/// Header 1: stored at offset 0x0, 0x48 bytes. Identifies the container and
/// anchors the hash chain (header 2 hash lives here, the partition table
/// hash lives in header 2).
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct FileHeader {
    /// [`WIA_MAGIC`] or [`RVZ_MAGIC`].
    pub magic: MagicBytes,
    /// Encoded as four bytes `A.BB.CC.DD`.
    pub version: U32,
    /// Oldest reader version able to read this file.
    pub version_compatible: U32,
    /// Serialized size of [`DiscInfo`].
    pub disc_info_size: U32,
    /// SHA-1 of the serialized [`DiscInfo`].
    pub disc_info_hash: HashBytes,
    /// Uncompressed size of the disc image.
    pub iso_file_size: U64,
    /// Size of this container file.
    pub container_size: U64,
    /// SHA-1 of this struct up to (not including) this field.
    pub header_hash: HashBytes,
}

static_assert!(size_of::<FileHeader>() == 0x48);

impl FileHeader {
    /// Checks the magic, version window, and header hash.
    pub fn validate(&self) -> Result<()> {
        if self.magic != WIA_MAGIC && self.magic != RVZ_MAGIC {
            return Err(Error::DiscFormat(format!("Invalid WIA/RVZ magic: {:#X?}", self.magic)));
        }
        let (version, read_compatible) = if self.is_rvz() {
            (RVZ_VERSION, RVZ_VERSION_READ_COMPATIBLE)
        } else {
            (WIA_VERSION, WIA_VERSION_READ_COMPATIBLE)
        };
        if version < self.version_compatible.get() || read_compatible > self.version.get() {
            return Err(Error::DiscFormat(format!(
                "Unsupported WIA/RVZ version: {} (compatible: {})",
                version_display(self.version.get()),
                version_display(self.version_compatible.get())
            )));
        }
        let bytes = self.as_bytes();
        crate::reader::verify_hash(
            &bytes[..bytes.len() - size_of::<HashBytes>()],
            &self.header_hash,
            "header 1",
        )?;
        Ok(())
    }

    /// Whether this is an RVZ container.
    #[inline]
    pub fn is_rvz(&self) -> bool { self.magic == RVZ_MAGIC }
}

/// Header 2: stored at offset 0x48, 0xDC bytes when serialized. Describes
/// the disc, the compression configuration, and locates the three tables.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct DiscInfo {
    /// 1 = GameCube, 2 = Wii.
    pub disc_type: U32,
    /// See [`compression_tag`].
    pub compression: U32,
    /// Informative only; never needed to decompress.
    pub compression_level: I32,
    /// Size of the chunks that data is divided into. Multiple of 2 MiB for
    /// WIA; RVZ additionally allows smaller powers of two down to 32 KiB.
    pub chunk_size: U32,
    /// The first 0x80 bytes of the disc image.
    pub disc_head: [u8; DISC_HEAD_SIZE],
    /// Number of [`PartitionEntry`] structs.
    pub num_partition_entries: U32,
    /// Serialized size of one [`PartitionEntry`].
    pub partition_entry_size: U32,
    /// File offset of the [`PartitionEntry`] table (stored uncompressed).
    pub partition_entries_offset: U64,
    /// SHA-1 of the partition entry table.
    pub partition_entries_hash: HashBytes,
    /// Number of [`RawDataEntry`] structs.
    pub num_raw_data_entries: U32,
    /// File offset of the [`RawDataEntry`] table (stored compressed).
    pub raw_data_entries_offset: U64,
    /// Stored (compressed) size of the [`RawDataEntry`] table.
    pub raw_data_entries_size: U32,
    /// Number of group entries.
    pub num_group_entries: U32,
    /// File offset of the group entry table (stored compressed).
    pub group_entries_offset: U64,
    /// Stored (compressed) size of the group entry table.
    pub group_entries_size: U32,
    /// Used length of `compressor_data`.
    pub compressor_data_len: u8,
    /// Codec parameters: 5 bytes of LZMA props or 1 byte LZMA2 dictionary
    /// size code (7-Zip encoding); empty for the other codecs.
    pub compressor_data: [u8; 7],
}

static_assert!(size_of::<DiscInfo>() == 0xDC);

impl DiscInfo {
    /// Checks the disc type, compression tag, chunk size, and entry sizes.
    pub fn validate(&self, is_rvz: bool) -> Result<()> {
        DiscKind::try_from(self.disc_type.get())?;
        compression_from_tag(self.compression.get())?;
        let chunk_size = self.chunk_size.get();
        if is_rvz {
            let valid_small = chunk_size >= SECTOR_SIZE as u32
                && chunk_size < 0x200000
                && chunk_size.is_power_of_two();
            if !valid_small && (chunk_size == 0 || chunk_size % 0x200000 != 0) {
                return Err(Error::DiscFormat(format!(
                    "Invalid RVZ chunk size: {:#X}",
                    chunk_size
                )));
            }
        } else if chunk_size < 0x200000 || chunk_size % 0x200000 != 0 {
            return Err(Error::DiscFormat(format!("Invalid WIA chunk size: {:#X}", chunk_size)));
        }
        if self.partition_entry_size.get() != size_of::<PartitionEntry>() as u32 {
            return Err(Error::DiscFormat(format!(
                "WIA/RVZ partition entry size is {}, expected {}",
                self.partition_entry_size.get(),
                size_of::<PartitionEntry>()
            )));
        }
        if self.compressor_data_len as usize > self.compressor_data.len() {
            return Err(Error::DiscFormat(format!(
                "Invalid compressor data length: {}",
                self.compressor_data_len
            )));
        }
        Ok(())
    }

    /// The compression configuration, combining the tag, level, and codec
    /// parameter blob.
    pub fn compression(&self) -> Result<Compression> {
        compression_from_tag(self.compression.get()).map(|c| match c {
            Compression::Bzip2(_) => Compression::Bzip2(self.compression_level.get() as u8),
            Compression::Lzma(_) => Compression::Lzma(self.compression_level.get() as u8),
            Compression::Lzma2(_) => Compression::Lzma2(self.compression_level.get() as u8),
            Compression::Zstandard(_) => Compression::Zstandard(self.compression_level.get() as i8),
            c => c,
        })
    }

    /// The used portion of the codec parameter blob.
    #[inline]
    pub fn compressor_data(&self) -> &[u8] {
        &self.compressor_data[..self.compressor_data_len as usize]
    }
}

/// Encodes a compression algorithm as its on-disk tag.
pub fn compression_tag(compression: Compression) -> u32 {
    match compression {
        Compression::None => 0,
        Compression::Purge => 1,
        Compression::Bzip2(_) => 2,
        Compression::Lzma(_) => 3,
        Compression::Lzma2(_) => 4,
        Compression::Zstandard(_) => 5,
    }
}

/// Decodes an on-disk compression tag (level-less).
pub fn compression_from_tag(tag: u32) -> Result<Compression> {
    match tag {
        0 => Ok(Compression::None),
        1 => Ok(Compression::Purge),
        2 => Ok(Compression::Bzip2(0)),
        3 => Ok(Compression::Lzma(0)),
        4 => Ok(Compression::Lzma2(0)),
        5 => Ok(Compression::Zstandard(0)),
        v => Err(Error::DiscFormat(format!("Invalid compression type {}", v))),
    }
}

/// One contiguous range of Wii partition data sectors.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PartitionDataEntry {
    /// First disc sector covered by this entry.
    pub first_sector: U32,
    /// Number of disc sectors covered.
    pub num_sectors: U32,
    /// Index of the first group entry for this range.
    pub group_index: U32,
    /// Number of group entries for this range.
    pub num_groups: U32,
}

static_assert!(size_of::<PartitionDataEntry>() == 0x10);

impl PartitionDataEntry {
    /// Disc offset of the first covered byte.
    #[inline]
    pub fn start_offset(&self) -> u64 { self.first_sector.get() as u64 * SECTOR_SIZE as u64 }

    /// Disc offset past the last covered byte.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.start_offset() + self.num_sectors.get() as u64 * SECTOR_SIZE as u64
    }

    /// Whether the given disc sector falls in this range.
    #[inline]
    pub fn contains_sector(&self, sector: u32) -> bool {
        let start = self.first_sector.get();
        sector >= start && sector < start + self.num_sectors.get()
    }
}

/// A Wii partition: the title key plus two [`PartitionDataEntry`]s covering
/// its encrypted data area (management data, then the remainder).
///
/// Partition data is stored decrypted with hashes removed: each 0x8000-byte
/// disc sector stores 0x7C00 bytes. Reading code regenerates the hash
/// blocks and applies the stored hash exceptions before re-encrypting.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PartitionEntry {
    /// AES-128 title key, usable without the Wii common key.
    pub partition_key: KeyBytes,
    /// The management data area, then the remaining data.
    pub data_entries: [PartitionDataEntry; 2],
}

static_assert!(size_of::<PartitionEntry>() == 0x30);

/// Disc data not covered by any partition data area, stored as-is (other
/// than compression).
///
/// The first entry nominally starts at 0x80; readers round the start down
/// to a sector boundary and take the first 0x80 bytes from
/// [`DiscInfo::disc_head`] instead.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct RawDataEntry {
    /// Disc offset at which this data starts.
    pub raw_data_offset: U64,
    /// Number of disc bytes covered.
    pub raw_data_size: U64,
    /// Index of the first group entry for this range.
    pub group_index: U32,
    /// Number of group entries for this range.
    pub num_groups: U32,
}

static_assert!(size_of::<RawDataEntry>() == 0x18);

impl RawDataEntry {
    /// Region start, rounded down to a sector boundary.
    #[inline]
    pub fn start_offset(&self) -> u64 { self.raw_data_offset.get() & !(SECTOR_SIZE as u64 - 1) }

    /// Disc offset past the last covered byte.
    #[inline]
    pub fn end_offset(&self) -> u64 { self.raw_data_offset.get() + self.raw_data_size.get() }
}

/// WIA group entry: locates one compressed group blob.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct GroupEntry {
    /// File offset of the data, divided by 4.
    pub data_offset: U32,
    /// Size of the stored data including exception lists. 0 means the whole
    /// group decodes to zero bytes and all exception lists are empty.
    pub data_size: U32,
}

static_assert!(size_of::<GroupEntry>() == 0x08);

/// RVZ group entry: like [`GroupEntry`], but the most significant bit of
/// `data_size_and_flag` distinguishes compressed from stored-as-is payloads,
/// and `rvz_packed_size` records the junk-packed stream size.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct RvzGroupEntry {
    /// File offset of the data, divided by 4.
    pub data_offset: U32,
    /// Bit 31: payload is compressed with the container codec.
    /// Bits 0-30: stored size; 0 means all-zero group (see [`GroupEntry`]).
    pub data_size_and_flag: U32,
    /// Size of the junk-packed payload stream before unpacking, or 0 if the
    /// payload is not packed.
    pub rvz_packed_size: U32,
}

static_assert!(size_of::<RvzGroupEntry>() == 0x0C);

impl RvzGroupEntry {
    /// Stored size of the group data.
    #[inline]
    pub fn data_size(&self) -> u32 { self.data_size_and_flag.get() & 0x7FFFFFFF }

    /// Whether the payload is compressed with the container codec.
    #[inline]
    pub fn is_compressed(&self) -> bool { self.data_size_and_flag.get() & 0x80000000 != 0 }

    /// File offset of the group data in bytes.
    #[inline]
    pub fn file_offset(&self) -> u64 { self.data_offset.get() as u64 * 4 }
}

impl From<&GroupEntry> for RvzGroupEntry {
    fn from(value: &GroupEntry) -> Self {
        Self {
            data_offset: value.data_offset,
            data_size_and_flag: U32::new(value.data_size.get() | 0x80000000),
            rvz_packed_size: U32::new(0),
        }
    }
}

impl From<&RvzGroupEntry> for GroupEntry {
    fn from(value: &RvzGroupEntry) -> Self {
        Self { data_offset: value.data_offset, data_size: value.data_size().into() }
    }
}

/// A single 20-byte difference between a recalculated hash block and the
/// original hash data of a Wii sector group.
///
/// `offset` addresses the concatenated hash areas of the covered sectors:
/// 0x0000-0x0400 is the first sector's hash block, 0x0400-0x0800 the
/// second's, and so on, restarting at 0 for each exception list.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct HashException {
    /// Position within the concatenated hash areas.
    pub offset: U16,
    /// Replacement for the recalculated hash bytes at `offset`.
    pub hash: HashBytes,
}

static_assert!(size_of::<HashException>() == 0x16);

/// Maximum exceptions per list accepted when the codec is one of the
/// compressed kinds. 52 slots per sector times 64 sectors.
pub const MAX_HASH_EXCEPTIONS_PER_LIST: usize = 52 * 64;

/// One record of the Purge codec: `size` payload bytes placed at `offset`
/// in the reconstructed group; gaps between segments are zero.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct PurgeSegment {
    /// Position of the payload in the reconstructed group.
    pub offset: U32,
    /// Number of payload bytes following the record.
    pub size: U32,
}

static_assert!(size_of::<PurgeSegment>() == 0x08);

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(format!("{}", version_display(0x01000000)), "1.00.00");
        assert_eq!(format!("{}", version_display(0x00080000)), "0.08.00");
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut info = DiscInfo::new_zeroed();
        info.disc_type.set(1);
        info.partition_entry_size.set(size_of::<PartitionEntry>() as u32);
        info.chunk_size.set(0x200000);
        assert!(info.validate(false).is_ok());
        assert!(info.validate(true).is_ok());
        info.chunk_size.set(0x20000);
        assert!(info.validate(false).is_err());
        assert!(info.validate(true).is_ok());
        info.chunk_size.set(0x30000);
        assert!(info.validate(true).is_err());
        info.chunk_size.set(0x4000);
        assert!(info.validate(true).is_err());
        info.chunk_size.set(0x600000);
        assert!(info.validate(false).is_ok());
        assert!(info.validate(true).is_ok());
    }

    #[test]
    fn test_group_entry_conversion() {
        let wia = GroupEntry { data_offset: 0x100.into(), data_size: 0x40.into() };
        let rvz = RvzGroupEntry::from(&wia);
        assert!(rvz.is_compressed());
        assert_eq!(rvz.data_size(), 0x40);
        assert_eq!(rvz.file_offset(), 0x400);
        assert_eq!(GroupEntry::from(&rvz), wia);
    }
}
