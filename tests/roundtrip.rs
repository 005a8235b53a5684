//! End-to-end conversion and read-back tests.

use std::io::Cursor;

use discpack::{
    common::{Compression, Format},
    convert,
    format::{DiscInfo, FileHeader, RvzGroupEntry, SECTOR_SIZE},
    lfg::LaggedFibonacci,
    reader::detect,
    wii::{encrypt_sector, hash_sector_group, HASHES_SIZE, SECTOR_DATA_SIZE},
    ConvertOptions, DiscVolume, Error, PartitionView, WiaReader,
};
use zerocopy::{FromBytes, IntoBytes};

const WII_MAGIC: [u8; 4] = [0x5D, 0x1C, 0x9E, 0xA3];
const GCN_MAGIC: [u8; 4] = [0xC2, 0x33, 0x9F, 0x3D];

struct Xorshift(u32);

impl Xorshift {
    fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 17;
            self.0 ^= self.0 << 5;
            *b = self.0 as u8;
        }
    }
}

struct TestVolume {
    head: [u8; 0x80],
    partitions: Vec<PartitionView>,
}

impl DiscVolume for TestVolume {
    fn disc_head(&self) -> [u8; 0x80] { self.head }

    fn is_wii(&self) -> bool { true }

    fn disc_id(&self) -> [u8; 4] { [self.head[0], self.head[1], self.head[2], self.head[3]] }

    fn disc_num(&self) -> u8 { self.head[6] }

    fn partitions(&self) -> Vec<PartitionView> { self.partitions.clone() }
}

fn gc_head(game_id: &[u8; 6]) -> [u8; 0x80] {
    let mut head = [0u8; 0x80];
    head[..6].copy_from_slice(game_id);
    head[0x1C..0x20].copy_from_slice(&GCN_MAGIC);
    head
}

fn convert_image(
    image: &[u8],
    volume: Option<&dyn DiscVolume>,
    options: &ConvertOptions,
) -> Vec<u8> {
    let mut source = Cursor::new(image.to_vec());
    let mut out = Cursor::new(Vec::new());
    convert(&mut source, volume, &mut out, options, None).expect("Conversion failed");
    out.into_inner()
}

fn read_back(container: &[u8], size: u64) -> Vec<u8> {
    let mut reader =
        WiaReader::new(Box::new(Cursor::new(container.to_vec()))).expect("Failed to open");
    assert_eq!(reader.data_size(), size);
    let mut buf = vec![0u8; size as usize];
    reader.read(0, &mut buf).expect("Failed to read image");
    buf
}

/// Builds an encrypted Wii image: a raw region up to the partition data
/// area, then `num_sectors` of hashed, encrypted partition data. Returns
/// the image and the plaintext payload bytes (0x7C00 per sector).
fn build_wii_image(
    key: [u8; 16],
    data_start_sector: u32,
    num_sectors: u32,
    payload_fill: impl Fn(&mut [u8], usize),
) -> (Vec<u8>, Vec<u8>, TestVolume) {
    let mut head = [0u8; 0x80];
    head[..6].copy_from_slice(b"RTSE01");
    head[0x18..0x1C].copy_from_slice(&WII_MAGIC);

    let part_start = data_start_sector as usize * SECTOR_SIZE;
    let mut image = vec![0u8; part_start + num_sectors as usize * SECTOR_SIZE];
    image[..0x80].copy_from_slice(&head);
    let mut rng = Xorshift(0xBADC0FFE);
    rng.fill(&mut image[0x80..part_start]);

    let mut payload = vec![0u8; num_sectors as usize * SECTOR_DATA_SIZE];
    for (sector, chunk) in payload.chunks_exact_mut(SECTOR_DATA_SIZE).enumerate() {
        payload_fill(chunk, sector);
    }

    for group in 0..(num_sectors as usize).div_ceil(64) {
        let group_sectors = (num_sectors as usize - group * 64).min(64);
        let mut buf = vec![0u8; SECTOR_SIZE * 64];
        for s in 0..group_sectors {
            let sector = group * 64 + s;
            buf[s * SECTOR_SIZE + HASHES_SIZE..(s + 1) * SECTOR_SIZE]
                .copy_from_slice(&payload[sector * SECTOR_DATA_SIZE..][..SECTOR_DATA_SIZE]);
        }
        let hashes = hash_sector_group(buf.as_slice().try_into().unwrap());
        for s in 0..group_sectors {
            let sector_buf: &mut [u8; SECTOR_SIZE] =
                (&mut buf[s * SECTOR_SIZE..(s + 1) * SECTOR_SIZE]).try_into().unwrap();
            hashes.apply(sector_buf, s);
            encrypt_sector(sector_buf, &key);
            let sector = group * 64 + s;
            image[part_start + sector * SECTOR_SIZE..part_start + (sector + 1) * SECTOR_SIZE]
                .copy_from_slice(sector_buf);
        }
    }

    let volume = TestVolume {
        head,
        partitions: vec![PartitionView {
            key,
            data_start_sector,
            data_end_sector: data_start_sector + num_sectors,
            management_end_sector: data_start_sector + 64,
        }],
    };
    (image, payload, volume)
}

// S1: empty image, store codec.
#[test]
fn test_empty_image_store() {
    let options = ConvertOptions {
        format: Format::Wia,
        compression: Compression::None,
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&[], None, &options);
    let mut reader =
        WiaReader::new(Box::new(Cursor::new(container.clone()))).expect("Failed to open");
    assert_eq!(reader.data_size(), 0);
    assert_eq!(reader.raw_size(), container.len() as u64);
    assert!(!reader.supports_read_wii_decrypted());
    reader.read(0, &mut []).expect("Empty read failed");
}

// S2: a single all-zero chunk elides to a zero group entry. (Zstandard is
// an RVZ codec; requesting it for WIA is rejected.)
#[test]
fn test_all_zero_chunk_zstd() {
    let image = vec![0u8; 0x200000];
    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Zstandard(3),
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);
    assert_eq!(read_back(&container, image.len() as u64), image);

    let mut source = Cursor::new(image);
    let mut out = Cursor::new(Vec::new());
    let mut wia_options = options;
    wia_options.format = Format::Wia;
    assert!(convert(&mut source, None, &mut out, &wia_options, None).is_err());
}

// S3: GameCube-style random image, Bzip2, one raw data region.
#[test]
fn test_gamecube_bzip2() {
    let mut image = vec![0u8; 16 * 1024 * 1024];
    Xorshift(0x1234ABCD).fill(&mut image);
    image[..0x80].copy_from_slice(&gc_head(b"GTSE01"));
    let options = ConvertOptions {
        format: Format::Wia,
        compression: Compression::Bzip2(9),
        chunk_size: 0x200000,
        processor_threads: 2,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);

    let mut reader =
        WiaReader::new(Box::new(Cursor::new(container.clone()))).expect("Failed to open");
    assert_eq!(reader.block_size(), 0x200000);
    assert!(!reader.supports_read_wii_decrypted());
    let header = FileHeader::read_from_bytes(&container[..0x48]).unwrap();
    let disc_info = DiscInfo::read_from_bytes(&container[0x48..0x48 + 0xDC]).unwrap();
    assert_eq!(disc_info.num_raw_data_entries.get(), 1);
    assert_eq!(disc_info.num_group_entries.get(), 8);
    assert_eq!(header.iso_file_size.get(), image.len() as u64);

    let mut buf = vec![0u8; image.len()];
    reader.read(0, &mut buf).expect("Failed to read image");
    assert_eq!(buf, image);
}

// S4: Wii partition, LZMA2, RVZ. Decrypted reads return the plaintext;
// full reads return the original encrypted bytes.
#[test]
fn test_wii_partition_lzma2_rvz() {
    let key = [0x42u8; 16];
    let (image, payload, volume) = build_wii_image(key, 4, 128, |chunk, sector| {
        let mut rng = Xorshift(0x9E3779B9 ^ sector as u32);
        rng.fill(chunk);
    });
    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Lzma2(0),
        chunk_size: 0x200000,
        processor_threads: 2,
        digests: Default::default(),
    };
    let container = convert_image(&image, Some(&volume), &options);

    let mut reader =
        WiaReader::new(Box::new(Cursor::new(container.clone()))).expect("Failed to open");
    assert!(reader.supports_read_wii_decrypted());
    assert_eq!(reader.format(), Format::Rvz);

    let mut decrypted = vec![0u8; payload.len()];
    reader
        .read_wii_decrypted(0, &mut decrypted, 4 * SECTOR_SIZE as u64)
        .expect("Failed to read decrypted");
    assert_eq!(decrypted, payload);

    let mut buf = vec![0u8; image.len()];
    reader.read(0, &mut buf).expect("Failed to read image");
    assert_eq!(buf, image);
}

// Stored hashes that don't match recalculation must survive the round trip
// via hash exceptions.
#[test]
fn test_wii_hash_exceptions_round_trip() {
    let key = [0x13u8; 16];
    let (mut image, _, volume) = build_wii_image(key, 4, 64, |chunk, sector| {
        chunk.fill(sector as u8 | 1);
    });
    // Corrupt hash bytes in two sectors, pre-encryption semantics: decrypt,
    // flip, re-encrypt
    let part_start = 4 * SECTOR_SIZE;
    for &(sector, offset) in &[(3usize, 0x12usize), (40, 0x3F0)] {
        let mut buf = [0u8; SECTOR_SIZE];
        let stored: &[u8; SECTOR_SIZE] =
            (&image[part_start + sector * SECTOR_SIZE..][..SECTOR_SIZE]).try_into().unwrap();
        discpack::wii::decrypt_sector_b2b(stored, &mut buf, &key);
        buf[offset] ^= 0xA5;
        encrypt_sector(&mut buf, &key);
        image[part_start + sector * SECTOR_SIZE..][..SECTOR_SIZE].copy_from_slice(&buf);
    }

    for (format, compression) in [
        (Format::Rvz, Compression::Zstandard(3)),
        (Format::Wia, Compression::Purge),
        (Format::Wia, Compression::None),
    ] {
        let options = ConvertOptions {
            format,
            compression,
            chunk_size: 0x200000,
            processor_threads: 0,
            digests: Default::default(),
        };
        let container = convert_image(&image, Some(&volume), &options);
        assert_eq!(read_back(&container, image.len() as u64), image, "{compression}");
    }
}

// RVZ with chunks smaller than a sector group: per-chunk exception lists
// and payload addressing.
#[test]
fn test_wii_small_chunk_rvz() {
    let key = [0x77u8; 16];
    let (image, payload, volume) = build_wii_image(key, 4, 128, |chunk, sector| {
        let mut rng = Xorshift(0x5555AAAA ^ sector as u32);
        rng.fill(chunk);
    });
    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Zstandard(1),
        chunk_size: 0x20000,
        processor_threads: 2,
        digests: Default::default(),
    };
    let container = convert_image(&image, Some(&volume), &options);

    let mut reader =
        WiaReader::new(Box::new(Cursor::new(container.clone()))).expect("Failed to open");
    let mut decrypted = vec![0u8; payload.len()];
    reader
        .read_wii_decrypted(0, &mut decrypted, 4 * SECTOR_SIZE as u64)
        .expect("Failed to read decrypted");
    assert_eq!(decrypted, payload);
    let mut buf = vec![0u8; image.len()];
    reader.read(0, &mut buf).expect("Failed to read image");
    assert_eq!(buf, image);
}

// S5: junk regions become packed records (or zero groups); the container
// stays small and decodes exactly.
#[test]
fn test_rvz_junk_elision() {
    let head = gc_head(b"GJNK01");
    let disc_id = [head[0], head[1], head[2], head[3]];
    let mut image = vec![0u8; 0x80000];
    image[..0x80].copy_from_slice(&head);
    // Sectors 1-14 are generator junk; sector 15 is real data
    let mut lfg = LaggedFibonacci::default();
    for sector in 1..15u64 {
        let start = sector as usize * SECTOR_SIZE;
        lfg.init_with_seed(disc_id, 0, sector * SECTOR_SIZE as u64);
        lfg.fill(&mut image[start..start + SECTOR_SIZE]);
    }
    Xorshift(7).fill(&mut image[15 * SECTOR_SIZE..]);

    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::None,
        chunk_size: 0x8000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);
    // 14 junk sectors collapse to seeds; only the head and data sectors
    // remain at full size
    assert!(container.len() < 3 * SECTOR_SIZE);
    assert_eq!(read_back(&container, image.len() as u64), image);
}

// S5: groups with identical constant content share one group entry.
#[test]
fn test_reuse_table_dedup() {
    let mut image = vec![0u8; 0x40000];
    image[..0x80].copy_from_slice(&gc_head(b"GRUS01"));
    image[0x8000..0x10000].fill(0x77);
    image[0x18000..0x20000].fill(0x77);
    Xorshift(99).fill(&mut image[0x20000..]);

    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::None,
        chunk_size: 0x8000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);
    assert_eq!(read_back(&container, image.len() as u64), image);

    // With store compression the group table is stored raw; inspect it
    let disc_info = DiscInfo::read_from_bytes(&container[0x48..0x48 + 0xDC]).unwrap();
    let offset = disc_info.group_entries_offset.get() as usize;
    let count = disc_info.num_group_entries.get() as usize;
    let mut groups = vec![RvzGroupEntry::default(); count];
    groups
        .as_mut_slice()
        .as_mut_bytes()
        .copy_from_slice(&container[offset..offset + count * 12]);
    assert_eq!(count, 8);
    assert_eq!(groups[1], groups[3], "identical groups share an entry");
    assert_ne!(groups[1].data_size(), 0);
}

// S6: corrupted header 2 hash rejects the file.
#[test]
fn test_corrupted_disc_info_hash() {
    let mut image = vec![0u8; 0x200000];
    Xorshift(3).fill(&mut image);
    image[..0x80].copy_from_slice(&gc_head(b"GBAD01"));
    let options = ConvertOptions {
        format: Format::Wia,
        compression: Compression::None,
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let mut container = convert_image(&image, None, &options);
    container[0x48 + 0x10] ^= 0xFF; // Inside header 2
    match WiaReader::new(Box::new(Cursor::new(container))) {
        Err(Error::DiscFormat(_)) => {}
        other => panic!("Expected DiscFormat error, got {:?}", other.err()),
    }
}

// Determinism: identical inputs produce identical containers regardless of
// thread count.
#[test]
fn test_deterministic_output() {
    let key = [0x2Au8; 16];
    let (image, _, volume) = build_wii_image(key, 4, 128, |chunk, sector| {
        let mut rng = Xorshift(0xC001D00D ^ sector as u32);
        rng.fill(chunk);
    });
    let options = |threads| ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Zstandard(3),
        chunk_size: 0x200000,
        processor_threads: threads,
        digests: Default::default(),
    };
    let single = convert_image(&image, Some(&volume), &options(0));
    let multi = convert_image(&image, Some(&volume), &options(3));
    assert_eq!(single, multi);
}

// The callback can cancel the conversion.
#[test]
fn test_callback_cancellation() {
    let mut image = vec![0u8; 0x800000];
    Xorshift(42).fill(&mut image);
    image[..0x80].copy_from_slice(&gc_head(b"GCAN01"));
    let mut source = Cursor::new(image);
    let mut out = Cursor::new(Vec::new());
    let options = ConvertOptions {
        format: Format::Wia,
        compression: Compression::None,
        chunk_size: 0x200000,
        processor_threads: 2,
        digests: Default::default(),
    };
    let mut calls = 0;
    let mut callback = |_: &discpack::ProgressInfo| {
        calls += 1;
        calls < 2
    };
    match convert(&mut source, None, &mut out, &options, Some(&mut callback)) {
        Err(Error::Cancelled) => {}
        other => panic!("Expected cancellation, got {:?}", other.err()),
    }
}

// LZMA (not LZMA2) round trip, plus compressor data in header 2.
#[test]
fn test_wia_lzma_round_trip() {
    let mut image = vec![0u8; 0x400000];
    Xorshift(0xFEED).fill(&mut image[..0x300000]);
    image[..0x80].copy_from_slice(&gc_head(b"GLZM01"));
    let options = ConvertOptions {
        format: Format::Wia,
        compression: Compression::Lzma(6),
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);
    let disc_info = DiscInfo::read_from_bytes(&container[0x48..0x48 + 0xDC]).unwrap();
    assert_eq!(disc_info.compressor_data_len, 5);
    assert_eq!(read_back(&container, image.len() as u64), image);
}

// Source digests are computed over the original image.
#[test]
fn test_digests() {
    let mut image = vec![0u8; 0x200000];
    Xorshift(0xD16E57).fill(&mut image);
    image[..0x80].copy_from_slice(&gc_head(b"GDIG01"));
    let mut source = Cursor::new(image.clone());
    let mut out = Cursor::new(Vec::new());
    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Zstandard(1),
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: discpack::DigestOptions { crc32: true, md5: false, sha1: true, xxh64: true },
    };
    let summary = convert(&mut source, None, &mut out, &options, None).expect("Conversion failed");
    assert_eq!(summary.crc32, Some(crc32fast::hash(&image)));
    assert_eq!(summary.xxh64, Some(xxhash_rust::xxh64::xxh64(&image, 0)));
    assert!(summary.sha1.is_some());
    assert!(summary.md5.is_none());
    assert_eq!(summary.bytes_written, out.get_ref().len() as u64);
}

// Format detection restores the stream position.
#[test]
fn test_detect() {
    let image = vec![0u8; 0x200000];
    let options = ConvertOptions {
        format: Format::Rvz,
        compression: Compression::Zstandard(1),
        chunk_size: 0x200000,
        processor_threads: 0,
        digests: Default::default(),
    };
    let container = convert_image(&image, None, &options);
    let mut stream = Cursor::new(container);
    assert_eq!(detect(&mut stream).unwrap(), Some(Format::Rvz));
    let mut stream = Cursor::new(vec![0u8; 0x40]);
    assert_eq!(detect(&mut stream).unwrap(), None);
}
