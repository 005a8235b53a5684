//! Random-access reader for WIA/RVZ containers.

use std::{
    collections::BTreeMap,
    io,
    io::{Read, Seek, SeekFrom},
    mem::size_of,
    sync::Arc,
};

use tracing::{debug, instrument};
use zerocopy::{FromBytes, FromZeros};

use crate::{
    chunk::Chunk,
    common::{Compression, Format, HashBytes},
    compress::Decompressor,
    format::{
        DiscInfo, FileHeader, GroupEntry, HashException, PartitionEntry, RawDataEntry,
        RvzGroupEntry, DISC_HEAD_SIZE, RVZ_MAGIC, SECTOR_GROUP_SIZE, SECTOR_SIZE, WIA_MAGIC,
    },
    util::{array_ref_mut, read_from, slice_from_bytes},
    volume::DiscStream,
    wii::{
        apply_hash_exceptions, encrypt_sector, hash_sector_group, sha1_hash, HASHES_SIZE,
        SECTORS_PER_GROUP, SECTOR_DATA_SIZE,
    },
    Error, Result, ResultContext,
};

pub(crate) fn verify_hash(buf: &[u8], expected: &HashBytes, what: &str) -> Result<()> {
    let out = sha1_hash(buf);
    if out != *expected {
        let mut got_bytes = [0u8; 40];
        let got = base16ct::lower::encode_str(&out, &mut got_bytes).unwrap(); // Safe: fixed buffer size
        let mut expected_bytes = [0u8; 40];
        let expected = base16ct::lower::encode_str(expected, &mut expected_bytes).unwrap(); // Safe: fixed buffer size
        return Err(Error::DiscFormat(format!(
            "WIA/RVZ {} hash mismatch: {}, expected {}",
            what, got, expected
        )));
    }
    Ok(())
}

/// Detects the container format from the magic bytes at the start of a
/// stream, restoring the stream position afterwards.
pub fn detect(stream: &mut dyn DiscStream) -> io::Result<Option<Format>> {
    let pos = stream.stream_position()?;
    stream.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 4];
    let result = stream.read_exact(&mut magic);
    stream.seek(SeekFrom::Start(pos))?;
    match result {
        Ok(()) => Ok(match magic {
            WIA_MAGIC => Some(Format::Wia),
            RVZ_MAGIC => Some(Format::Rvz),
            _ => None,
        }),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Where a disc offset lives: a raw-data region or a partition data area.
#[derive(Clone, Copy, Debug)]
enum DataEntryRef {
    Raw(usize),
    Partition { index: usize, part_data: usize },
}

/// An open WIA/RVZ container.
///
/// Holds the parsed headers and tables, a single-slot group cache, and (for
/// Wii discs) a single-slot cache of the most recently re-encrypted sector
/// group. Not safe for concurrent access.
pub struct WiaReader {
    stream: Box<dyn DiscStream>,
    header: FileHeader,
    disc_info: DiscInfo,
    compression: Compression,
    compressor_data: Box<[u8]>,
    partitions: Arc<[PartitionEntry]>,
    raw_data: Arc<[RawDataEntry]>,
    groups: Arc<[RvzGroupEntry]>,
    data_entries: BTreeMap<u64, DataEntryRef>,
    cached_chunk: Option<Chunk>,
    encrypted_group: Option<(u64, Box<[u8; SECTOR_GROUP_SIZE]>)>,
}

impl WiaReader {
    /// Opens a container, parsing and hash-verifying the headers and
    /// tables.
    #[instrument(name = "WiaReader::new", skip_all)]
    pub fn new(mut stream: Box<dyn DiscStream>) -> Result<Self> {
        stream.seek(SeekFrom::Start(0)).context("Seeking to start")?;
        let header: FileHeader = read_from(stream.as_mut()).context("Reading file header")?;
        header.validate()?;
        let is_rvz = header.is_rvz();
        debug!("Header: {:?}", header);

        let mut disc_info_buf = vec![0u8; header.disc_info_size.get() as usize];
        stream.read_exact(&mut disc_info_buf).context("Reading disc info")?;
        verify_hash(&disc_info_buf, &header.disc_info_hash, "disc info")?;
        disc_info_buf.resize(size_of::<DiscInfo>(), 0);
        let disc_info = DiscInfo::read_from_bytes(disc_info_buf.as_slice()).unwrap();
        disc_info.validate(is_rvz)?;
        debug!("Disc info: {:?}", disc_info);

        let compression = disc_info.compression()?;
        if is_rvz && compression == Compression::Purge {
            return Err(Error::DiscFormat("Purge compression is not valid in RVZ".to_string()));
        }
        if !is_rvz && matches!(compression, Compression::Zstandard(_)) {
            return Err(Error::DiscFormat("Zstandard compression is not valid in WIA".to_string()));
        }
        let compressor_data: Box<[u8]> = Box::from(disc_info.compressor_data());

        stream
            .seek(SeekFrom::Start(disc_info.partition_entries_offset.get()))
            .context("Seeking to partition entries")?;
        let mut partition_buf =
            vec![
                0u8;
                disc_info.num_partition_entries.get() as usize * size_of::<PartitionEntry>()
            ];
        stream.read_exact(&mut partition_buf).context("Reading partition entries")?;
        verify_hash(&partition_buf, &disc_info.partition_entries_hash, "partition entries")?;
        let partitions: Arc<[PartitionEntry]> =
            slice_from_bytes(&partition_buf, disc_info.num_partition_entries.get() as usize)
                .context("Decoding partition entries")?;
        debug!("Partitions: {:?}", partitions);

        let raw_data: Arc<[RawDataEntry]> = {
            let buf = read_table(
                stream.as_mut(),
                compression,
                &compressor_data,
                disc_info.raw_data_entries_offset.get(),
                disc_info.raw_data_entries_size.get(),
                disc_info.num_raw_data_entries.get() as usize * size_of::<RawDataEntry>(),
            )
            .context("Reading raw data entries")?;
            slice_from_bytes(&buf, disc_info.num_raw_data_entries.get() as usize)
                .context("Decoding raw data entries")?
        };
        debug!("Num raw data entries: {}", raw_data.len());

        let groups: Arc<[RvzGroupEntry]> = {
            let entry_size =
                if is_rvz { size_of::<RvzGroupEntry>() } else { size_of::<GroupEntry>() };
            let buf = read_table(
                stream.as_mut(),
                compression,
                &compressor_data,
                disc_info.group_entries_offset.get(),
                disc_info.group_entries_size.get(),
                disc_info.num_group_entries.get() as usize * entry_size,
            )
            .context("Reading group entries")?;
            if is_rvz {
                slice_from_bytes(&buf, disc_info.num_group_entries.get() as usize)
                    .context("Decoding group entries")?
            } else {
                let wia_groups: Arc<[GroupEntry]> =
                    slice_from_bytes(&buf, disc_info.num_group_entries.get() as usize)
                        .context("Decoding group entries")?;
                wia_groups.iter().map(RvzGroupEntry::from).collect()
            }
        };
        debug!("Num groups: {}", groups.len());

        let data_entries = build_data_entries(&partitions, &raw_data, groups.len() as u32)?;
        Ok(Self {
            stream,
            header,
            disc_info,
            compression,
            compressor_data,
            partitions,
            raw_data,
            groups,
            data_entries,
            cached_chunk: None,
            encrypted_group: None,
        })
    }

    /// Size of the container file.
    #[inline]
    pub fn raw_size(&self) -> u64 { self.header.container_size.get() }

    /// Uncompressed size of the disc image.
    #[inline]
    pub fn data_size(&self) -> u64 { self.header.iso_file_size.get() }

    /// The chunk size data is divided into.
    #[inline]
    pub fn block_size(&self) -> u32 { self.disc_info.chunk_size.get() }

    /// The container records the exact image size.
    #[inline]
    pub fn is_data_size_accurate(&self) -> bool { true }

    /// Groups decode front to back; random access within a group decodes
    /// up to the requested offset.
    #[inline]
    pub fn has_fast_random_access_in_block(&self) -> bool { false }

    /// The container format.
    #[inline]
    pub fn format(&self) -> Format {
        if self.header.is_rvz() {
            Format::Rvz
        } else {
            Format::Wia
        }
    }

    /// The compression configuration.
    #[inline]
    pub fn compression(&self) -> Compression { self.compression }

    /// Whether [`read_wii_decrypted`](Self::read_wii_decrypted) is
    /// available.
    #[inline]
    pub fn supports_read_wii_decrypted(&self) -> bool { !self.partitions.is_empty() }

    /// Reads `out.len()` bytes of the original disc image at `offset`.
    /// Partition data is re-hashed and re-encrypted to reproduce the
    /// original bytes exactly.
    #[instrument(name = "WiaReader::read", skip_all)]
    pub fn read(&mut self, mut offset: u64, out: &mut [u8]) -> Result<()> {
        let mut out = out;
        if offset.checked_add(out.len() as u64).map_or(true, |end| end > self.data_size()) {
            return Err(Error::DiscFormat(format!(
                "Read at {:#X} past end of disc image",
                offset
            )));
        }
        while !out.is_empty() {
            let entry = self.data_entries.range(..=offset).next_back().map(|(_, &entry)| entry);
            let n = match entry {
                Some(DataEntryRef::Raw(index)) => self.read_raw(index, offset, out)?,
                Some(DataEntryRef::Partition { index, part_data }) => {
                    self.read_partition_encrypted(index, part_data, offset, out)?
                }
                None if offset < DISC_HEAD_SIZE as u64 => {
                    // Tiny images fit entirely in the stored disc head
                    let n = out.len().min((DISC_HEAD_SIZE as u64 - offset) as usize);
                    out[..n].copy_from_slice(
                        &self.disc_info.disc_head[offset as usize..offset as usize + n],
                    );
                    n
                }
                None => {
                    return Err(Error::DiscFormat(format!(
                        "Unmapped disc offset {:#X}",
                        offset
                    )))
                }
            };
            offset += n as u64;
            out = &mut out[n..];
        }
        Ok(())
    }

    /// Reads decrypted partition data. `offset` addresses the partition's
    /// data bytes contiguously (0x7C00 per sector); `partition_data_offset`
    /// is the disc offset of the partition's data area, identifying the
    /// partition.
    #[instrument(name = "WiaReader::read_wii_decrypted", skip_all)]
    pub fn read_wii_decrypted(
        &mut self,
        mut offset: u64,
        out: &mut [u8],
        partition_data_offset: u64,
    ) -> Result<()> {
        let index = self
            .partitions
            .iter()
            .position(|p| p.data_entries[0].start_offset() == partition_data_offset)
            .ok_or_else(|| {
                Error::DiscFormat(format!(
                    "No partition with data offset {:#X}",
                    partition_data_offset
                ))
            })?;
        let mut out = out;
        while !out.is_empty() {
            let n = self.read_partition_decrypted(index, offset, out)?;
            offset += n as u64;
            out = &mut out[n..];
        }
        Ok(())
    }

    /// Reads from a raw-data region, overlaying the stored disc head over
    /// the first 0x80 bytes.
    fn read_raw(&mut self, index: usize, offset: u64, out: &mut [u8]) -> Result<usize> {
        let entry = &self.raw_data[index];
        let region_start = entry.start_offset();
        let region_end = entry.end_offset();
        if offset >= region_end {
            return Err(Error::DiscFormat(format!("Unmapped disc offset {:#X}", offset)));
        }
        let chunk_size = self.disc_info.chunk_size.get() as u64;
        let chunk_index = (offset - region_start) / chunk_size;
        let chunk_start = region_start + chunk_index * chunk_size;
        let chunk_end = (chunk_start + chunk_size).min(region_end);
        let group_index = check_group_index(
            entry.group_index.get(),
            chunk_index,
            entry.num_groups.get(),
            self.groups.len(),
        )?;

        let n = out.len().min((chunk_end - offset) as usize);
        let payload_size = (chunk_end - chunk_start) as usize;
        let payload_offset = (offset - chunk_start) as usize;
        self.read_group_payload(
            group_index,
            payload_size,
            0,
            chunk_start,
            payload_offset,
            &mut out[..n],
        )?;
        if offset < DISC_HEAD_SIZE as u64 {
            let head = self.disc_info.disc_head;
            let copy = (DISC_HEAD_SIZE as u64 - offset).min(n as u64) as usize;
            out[..copy].copy_from_slice(&head[offset as usize..offset as usize + copy]);
        }
        Ok(n)
    }

    /// Reads original (encrypted) bytes from a partition data area by
    /// rebuilding one sector group: decode plaintext, recompute hashes,
    /// apply stored exceptions, encrypt.
    fn read_partition_encrypted(
        &mut self,
        index: usize,
        part_data: usize,
        offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let part = &self.partitions[index];
        let entry = &part.data_entries[part_data];
        let area_end = entry.end_offset();
        if offset >= area_end {
            return Err(Error::DiscFormat(format!("Unmapped disc offset {:#X}", offset)));
        }
        let part_first = part.data_entries[0].first_sector.get();
        let sector = (offset / SECTOR_SIZE as u64) as u32;
        let group_in_part = (sector - part_first) / SECTORS_PER_GROUP as u32;
        let cache_key = ((index as u64) << 32) | group_in_part as u64;
        if !matches!(&self.encrypted_group, Some((key, _)) if *key == cache_key) {
            let buf = self.build_encrypted_group(index, group_in_part)?;
            self.encrypted_group = Some((cache_key, buf));
        }
        let (_, group_buf) = self.encrypted_group.as_ref().unwrap();

        let group_start =
            (part_first + group_in_part * SECTORS_PER_GROUP as u32) as u64 * SECTOR_SIZE as u64;
        let group_end = (group_start + SECTOR_GROUP_SIZE as u64).min(area_end);
        let n = out.len().min((group_end - offset) as usize);
        let group_offset = (offset - group_start) as usize;
        out[..n].copy_from_slice(&group_buf[group_offset..group_offset + n]);
        Ok(n)
    }

    /// Reads decrypted payload bytes from a partition's chunks.
    fn read_partition_decrypted(
        &mut self,
        index: usize,
        offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let part = self.partitions[index].clone();
        let part_first = part.data_entries[0].first_sector.get();
        let part_sector = (offset / SECTOR_DATA_SIZE as u64) as u32;
        let abs_sector = part_first + part_sector;
        let entry = part
            .data_entries
            .iter()
            .find(|pd| pd.contains_sector(abs_sector))
            .ok_or_else(|| {
                Error::DiscFormat(format!("Partition data offset {:#X} out of range", offset))
            })?;
        let location = self.locate_partition_chunk(&part, entry, abs_sector)?;

        let sector_offset = (offset % SECTOR_DATA_SIZE as u64) as usize;
        let payload_offset = (abs_sector - location.chunk_first_sector) as usize
            * SECTOR_DATA_SIZE
            + sector_offset;
        // Stop at the chunk boundary; the next iteration picks up there
        let n = out.len().min(location.payload_size - payload_offset);
        self.read_group_payload(
            location.group_index,
            location.payload_size,
            location.num_lists,
            location.data_offset,
            payload_offset,
            &mut out[..n],
        )?;
        Ok(n)
    }

    /// Rebuilds one fully-encrypted sector group of a partition.
    fn build_encrypted_group(
        &mut self,
        index: usize,
        group_in_part: u32,
    ) -> Result<Box<[u8; SECTOR_GROUP_SIZE]>> {
        let part = self.partitions[index].clone();
        let part_first = part.data_entries[0].first_sector.get();
        let part_end = part
            .data_entries
            .iter()
            .map(|pd| pd.first_sector.get() + pd.num_sectors.get())
            .max()
            .unwrap_or(part_first);
        let group_first = part_first + group_in_part * SECTORS_PER_GROUP as u32;
        let group_sectors = (part_end - group_first).min(SECTORS_PER_GROUP as u32);

        let mut plaintext = <[u8; SECTOR_GROUP_SIZE]>::new_box_zeroed()?;
        let mut exceptions: Vec<HashException> = Vec::new();
        let mut sector = group_first;
        let mut collected_group = u32::MAX;
        while sector < group_first + group_sectors {
            let entry = part
                .data_entries
                .iter()
                .find(|pd| pd.contains_sector(sector))
                .ok_or_else(|| {
                    Error::DiscFormat(format!("Partition sector {} not covered", sector))
                })?;
            let location = self.locate_partition_chunk(&part, entry, sector)?;
            let payload_offset =
                (sector - location.chunk_first_sector) as usize * SECTOR_DATA_SIZE;
            let dest_sector = (sector - group_first) as usize;
            self.read_group_payload(
                location.group_index,
                location.payload_size,
                location.num_lists,
                location.data_offset,
                payload_offset,
                array_ref_mut![
                    plaintext,
                    dest_sector * SECTOR_SIZE + HASHES_SIZE,
                    SECTOR_DATA_SIZE
                ],
            )?;
            if collected_group != location.group_index {
                // One exception list covers this sector group within the
                // chunk; offsets re-base to the group's first hash
                let list_index =
                    ((group_first.max(location.chunk_first_sector) - location.chunk_first_sector)
                        / SECTORS_PER_GROUP as u32) as usize;
                let additional_offset = ((location.chunk_first_sector.max(group_first)
                    - group_first) as usize
                    * HASHES_SIZE) as u16;
                self.group_hash_exceptions(
                    location.group_index,
                    list_index,
                    additional_offset,
                    &mut exceptions,
                )?;
                collected_group = location.group_index;
            }
            sector += 1;
        }

        let hashes = hash_sector_group(&plaintext);
        for s in 0..group_sectors as usize {
            hashes.apply(array_ref_mut![plaintext, s * SECTOR_SIZE, SECTOR_SIZE], s);
        }
        apply_hash_exceptions(&exceptions, &mut plaintext)
            .map_err(|e| Error::DiscFormat(e.to_string()))?;
        for s in 0..group_sectors as usize {
            encrypt_sector(
                array_ref_mut![plaintext, s * SECTOR_SIZE, SECTOR_SIZE],
                &part.partition_key,
            );
        }
        Ok(plaintext)
    }

    /// Finds the chunk and group entry covering a partition sector.
    fn locate_partition_chunk(
        &self,
        part: &PartitionEntry,
        entry: &crate::format::PartitionDataEntry,
        sector: u32,
    ) -> Result<ChunkLocation> {
        let chunk_size = self.disc_info.chunk_size.get();
        let chunk_sectors = chunk_size / SECTOR_SIZE as u32;
        let pd_first = entry.first_sector.get();
        let pd_end = pd_first + entry.num_sectors.get();
        let chunk_index = (sector - pd_first) / chunk_sectors;
        let chunk_first_sector = pd_first + chunk_index * chunk_sectors;
        let chunk_end = (chunk_first_sector + chunk_sectors).min(pd_end);
        let group_index = check_group_index(
            entry.group_index.get(),
            chunk_index as u64,
            entry.num_groups.get(),
            self.groups.len(),
        )?;
        Ok(ChunkLocation {
            group_index,
            chunk_first_sector,
            payload_size: (chunk_end - chunk_first_sector) as usize * SECTOR_DATA_SIZE,
            num_lists: (chunk_size as usize).div_ceil(SECTOR_GROUP_SIZE),
            data_offset: (chunk_first_sector - part.data_entries[0].first_sector.get()) as u64
                * SECTOR_DATA_SIZE as u64,
        })
    }

    /// Reads payload bytes from a group, using the chunk cache. Zero-size
    /// group entries decode as zero fill without touching the container.
    fn read_group_payload(
        &mut self,
        group_index: u32,
        payload_size: usize,
        num_lists: usize,
        data_offset: u64,
        payload_offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let group = self.groups[group_index as usize].clone();
        if group.data_size() == 0 {
            out.fill(0);
            return Ok(());
        }
        self.ensure_cached_chunk(&group, payload_size, num_lists, data_offset)?;
        let chunk = self.cached_chunk.as_mut().unwrap();
        chunk
            .read(self.stream.as_mut(), payload_offset, out)
            .with_context(|| format!("Decoding group {}", group_index))?;
        Ok(())
    }

    /// Appends the stored hash exceptions of one list of a group's chunk.
    fn group_hash_exceptions(
        &mut self,
        group_index: u32,
        list_index: usize,
        additional_offset: u16,
        out: &mut Vec<HashException>,
    ) -> Result<()> {
        let group = self.groups[group_index as usize].clone();
        if group.data_size() == 0 {
            return Ok(());
        }
        let chunk = self
            .cached_chunk
            .as_ref()
            .filter(|chunk| chunk.file_offset() == group.file_offset())
            .ok_or_else(|| {
                Error::Other(format!("Group {} not decoded before exception access", group_index))
            })?;
        chunk
            .append_hash_exceptions(list_index, additional_offset, out)
            .with_context(|| format!("Reading group {} hash exceptions", group_index))?;
        Ok(())
    }

    /// Evicts and rebuilds the cached chunk if it does not match the
    /// requested group.
    fn ensure_cached_chunk(
        &mut self,
        group: &RvzGroupEntry,
        payload_size: usize,
        num_lists: usize,
        data_offset: u64,
    ) -> Result<()> {
        let file_offset = group.file_offset();
        if matches!(&self.cached_chunk, Some(chunk) if chunk.file_offset() == file_offset) {
            return Ok(());
        }
        self.cached_chunk = None;
        let compressed = group.is_compressed();
        let compression = if compressed { self.compression } else { Compression::None };
        let compressed_lists = compressed
            && !matches!(self.compression, Compression::None | Compression::Purge);
        let decoder = Decompressor::new(compression, &self.compressor_data, payload_size)?;
        let chunk = Chunk::new(
            file_offset,
            group.data_size() as usize,
            payload_size,
            num_lists,
            compressed_lists,
            compressed_lists,
            group.rvz_packed_size.get() > 0,
            data_offset,
            decoder,
        )
        .context("Setting up group decompression")?;
        self.cached_chunk = Some(chunk);
        Ok(())
    }
}

struct ChunkLocation {
    group_index: u32,
    chunk_first_sector: u32,
    payload_size: usize,
    num_lists: usize,
    data_offset: u64,
}

fn check_group_index(
    base: u32,
    index: u64,
    num_groups: u32,
    total: usize,
) -> Result<u32> {
    if index >= num_groups as u64 {
        return Err(Error::DiscFormat(format!(
            "Group index {} out of range for entry with {} groups",
            index, num_groups
        )));
    }
    let group_index = base as u64 + index;
    if group_index >= total as u64 {
        return Err(Error::DiscFormat(format!("Group index {} out of range", group_index)));
    }
    Ok(group_index as u32)
}

/// Reads and decompresses one of the entry tables.
fn read_table(
    stream: &mut dyn DiscStream,
    compression: Compression,
    compressor_data: &[u8],
    offset: u64,
    compressed_size: u32,
    decompressed_size: usize,
) -> Result<Vec<u8>> {
    let decoder = Decompressor::new(compression, compressor_data, decompressed_size)?;
    let mut chunk = Chunk::new(
        offset,
        compressed_size as usize,
        decompressed_size,
        0,
        true,
        false,
        false,
        0,
        decoder,
    )
    .context("Setting up table decompression")?;
    let mut buf = vec![0u8; decompressed_size];
    chunk.read(stream, 0, &mut buf).context("Decompressing table")?;
    Ok(buf)
}

/// Builds the offset-keyed index over partition data areas and raw-data
/// regions, rejecting overlapping or out-of-bounds extents.
fn build_data_entries(
    partitions: &[PartitionEntry],
    raw_data: &[RawDataEntry],
    num_groups: u32,
) -> Result<BTreeMap<u64, DataEntryRef>> {
    let mut entries: Vec<(u64, u64, DataEntryRef)> = Vec::new();
    for (index, part) in partitions.iter().enumerate() {
        for (part_data, pd) in part.data_entries.iter().enumerate() {
            if pd.num_sectors.get() == 0 {
                continue;
            }
            entries.push((
                pd.start_offset(),
                pd.end_offset(),
                DataEntryRef::Partition { index, part_data },
            ));
        }
    }
    for (index, rd) in raw_data.iter().enumerate() {
        if rd.raw_data_size.get() == 0 {
            continue;
        }
        if rd.start_offset() % SECTOR_SIZE as u64 != 0 {
            return Err(Error::DiscFormat(format!(
                "Raw data entry {} not sector aligned: {:#X}",
                index,
                rd.raw_data_offset.get()
            )));
        }
        entries.push((rd.start_offset(), rd.end_offset(), DataEntryRef::Raw(index)));
    }
    entries.sort_by_key(|&(start, _, _)| start);
    let mut map = BTreeMap::new();
    let mut prev_end = 0u64;
    let mut total_groups = 0u64;
    for &(start, end, entry) in &entries {
        if start < prev_end {
            return Err(Error::DiscFormat(format!(
                "Data entries overlap at {:#X}..{:#X}",
                start, end
            )));
        }
        prev_end = end;
        total_groups += match entry {
            DataEntryRef::Raw(index) => raw_data[index].num_groups.get() as u64,
            DataEntryRef::Partition { index, part_data } => {
                partitions[index].data_entries[part_data].num_groups.get() as u64
            }
        };
        map.insert(start, entry);
    }
    if total_groups > num_groups as u64 {
        return Err(Error::DiscFormat(format!(
            "Data entries reference {} groups, but only {} are stored",
            total_groups, num_groups
        )));
    }
    Ok(map)
}
