//! Conversion of a raw disc image into a WIA/RVZ container.
//!
//! The writer plans the entry tables up front, then streams groups through
//! a parallel pipeline: one producer reads the source in disc order,
//! workers decrypt/pack/compress independently, and a single collector
//! writes groups in submission order so the output layout is deterministic.

use std::{
    collections::VecDeque,
    io,
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    sync::Mutex,
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument};
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    common::{Compression, DiscKind, Format, KeyBytes},
    compress::{compress_bound, compressor_data, Compressor},
    digest::{DigestManager, DigestOptions},
    format::{
        compression_tag, DiscInfo, FileHeader, GroupEntry, HashException, PartitionDataEntry,
        PartitionEntry, RawDataEntry, RvzGroupEntry, DISC_HEAD_SIZE,
        MAX_HASH_EXCEPTIONS_PER_LIST, RVZ_MAGIC, RVZ_VERSION, RVZ_VERSION_WRITE_COMPATIBLE,
        SECTOR_GROUP_SIZE, SECTOR_SIZE, WIA_MAGIC, WIA_VERSION, WIA_VERSION_WRITE_COMPATIBLE,
    },
    lfg::LaggedFibonacci,
    pack::rvz_pack,
    util::Align,
    volume::{DiscStream, DiscVolume, PartitionView},
    wii::{
        canonical_hash_block, decrypt_sector_b2b, derive_sector_exceptions, hash_sector_group,
        sha1_hash, HASHES_SIZE, SECTORS_PER_GROUP, SECTOR_DATA_SIZE,
    },
    Error, ErrorContext, Result, ResultContext,
};

/// Default chunk size for WIA. (2 MiB)
pub const WIA_DEFAULT_CHUNK_SIZE: u32 = 0x200000;
/// Default chunk size for RVZ. (128 KiB)
pub const RVZ_DEFAULT_CHUNK_SIZE: u32 = 0x20000;

// Level 0 becomes the codec default in [`Compression::validate_level`]
/// Default compression for WIA.
pub const WIA_DEFAULT_COMPRESSION: Compression = Compression::Lzma(0);
/// Default compression for RVZ.
pub const RVZ_DEFAULT_COMPRESSION: Compression = Compression::Zstandard(0);

/// Options for a conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// The container format to write.
    pub format: Format,
    /// The compression algorithm.
    pub compression: Compression,
    /// The chunk size. Must be valid for the format.
    pub chunk_size: u32,
    /// Worker threads for compression. 0 runs the pipeline on the calling
    /// thread.
    pub processor_threads: usize,
    /// Source-image digests to compute alongside the conversion.
    pub digests: DigestOptions,
}

impl ConvertOptions {
    /// Creates options with the format's default compression and chunk
    /// size.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            compression: format.default_compression(),
            chunk_size: format.default_chunk_size(),
            processor_threads: 0,
            digests: DigestOptions::default(),
        }
    }
}

/// Progress reported after each group of a conversion.
#[derive(Debug, Clone, Default)]
pub struct ProgressInfo {
    /// Group entries finalized so far.
    pub groups_written: u32,
    /// Total group entries planned.
    pub total_groups: u32,
    /// Source bytes consumed so far.
    pub bytes_read: u64,
    /// Container bytes written so far.
    pub bytes_written: u64,
}

/// Result of a completed conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionSummary {
    /// Number of group entries written.
    pub groups_written: u32,
    /// Final container size in bytes.
    pub bytes_written: u64,
    /// CRC32 of the source image, if requested.
    pub crc32: Option<u32>,
    /// MD5 of the source image, if requested.
    pub md5: Option<[u8; 16]>,
    /// SHA-1 of the source image, if requested.
    pub sha1: Option<[u8; 20]>,
    /// XXH64 of the source image, if requested.
    pub xxh64: Option<u64>,
}

/// Identifies groups whose stored bytes can be shared: a group whose
/// payload is a single repeated byte and whose exception lists are empty.
/// Ordering is the tuple ordering of the fields.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReuseID {
    partition_key: Option<KeyBytes>,
    data_size: u64,
    /// Always false here: partition payloads are decrypted before entry
    /// processing, so every keyed payload is plaintext.
    encrypted: bool,
    value: u8,
}

struct JobSpec {
    first_group: u32,
    disc_offset: u64,
    disc_size: usize,
    /// Leading bytes to store as zero (covered by the disc head in
    /// header 2).
    zero_head: usize,
    kind: JobKind,
}

#[derive(Clone)]
enum JobKind {
    Raw,
    Partition { key: KeyBytes, data_start_sector: u32 },
}

struct Plan {
    disc_type: DiscKind,
    disc_head: [u8; DISC_HEAD_SIZE],
    disc_id: [u8; 4],
    disc_num: u8,
    partition_entries: Vec<PartitionEntry>,
    raw_data_entries: Vec<RawDataEntry>,
    total_groups: u32,
    jobs: Vec<JobSpec>,
}

/// One group entry produced by a worker.
struct GroupOut {
    group: RvzGroupEntry,
    data: Bytes,
    reuse_id: Option<ReuseID>,
    reused: bool,
}

struct JobOutput {
    job_index: usize,
    first_group: u32,
    entries: Vec<GroupOut>,
    disc_size: usize,
}

/// Per-worker scratch: its own compressor, junk generator, and decryption
/// buffer. Never shared.
struct WorkerState {
    compressor: Compressor,
    lfg: LaggedFibonacci,
    plaintext: Box<[u8; SECTOR_GROUP_SIZE]>,
}

/// Shared, read-only conversion parameters.
struct ConvertContext {
    rvz: bool,
    compression: Compression,
    chunk_size: u32,
    disc_id: [u8; 4],
    disc_num: u8,
    reuse: Mutex<std::collections::BTreeMap<ReuseID, RvzGroupEntry>>,
}

/// Converts a raw disc image to a WIA/RVZ container.
///
/// `volume` supplies partition keys and layout for Wii discs; with `None`
/// the whole image is stored as raw data. The callback is invoked after
/// each group; returning `false` cancels the conversion.
#[instrument(name = "convert", skip_all)]
pub fn convert<W>(
    source: &mut dyn DiscStream,
    volume: Option<&dyn DiscVolume>,
    out: &mut W,
    options: &ConvertOptions,
    mut callback: Option<&mut dyn FnMut(&ProgressInfo) -> bool>,
) -> Result<ConversionSummary>
where
    W: Write + Seek,
{
    let rvz = options.format == Format::Rvz;
    let mut compression = options.compression;
    compression.validate_level()?;
    validate_config(options.format, compression, options.chunk_size)?;

    let iso_size = source.seek(SeekFrom::End(0)).context("Determining source size")?;
    let plan = plan_conversion(source, volume, iso_size, options.chunk_size)?;
    debug!(
        "Planned {} partitions, {} raw data entries, {} groups",
        plan.partition_entries.len(),
        plan.raw_data_entries.len(),
        plan.total_groups
    );

    let mut disc_info = DiscInfo::new_zeroed();
    disc_info.disc_type.set(plan.disc_type.into());
    disc_info.compression.set(compression_tag(compression));
    disc_info.compression_level.set(compression.level());
    disc_info.chunk_size.set(options.chunk_size);
    disc_info.disc_head = plan.disc_head;
    disc_info.num_partition_entries.set(plan.partition_entries.len() as u32);
    disc_info.partition_entry_size.set(size_of::<PartitionEntry>() as u32);
    disc_info.num_raw_data_entries.set(plan.raw_data_entries.len() as u32);
    disc_info.num_group_entries.set(plan.total_groups);
    let codec_params = compressor_data(compression).context("Building compressor data")?;
    disc_info.compressor_data_len = codec_params.len() as u8;
    disc_info.compressor_data[..codec_params.len()].copy_from_slice(&codec_params);

    // Header 1, header 2, partition table, compressed raw-data table; group
    // blobs follow, and the group table goes last
    let partition_table = plan.partition_entries.as_slice().as_bytes();
    disc_info.partition_entries_hash = sha1_hash(partition_table);
    let partition_entries_offset = (size_of::<FileHeader>() + size_of::<DiscInfo>()) as u64;
    disc_info.partition_entries_offset.set(partition_entries_offset);
    let raw_data_offset = partition_entries_offset + partition_table.len() as u64;
    disc_info.raw_data_entries_offset.set(raw_data_offset);
    let compressed_raw_table = compress_table(compression, plan.raw_data_entries.as_slice().as_bytes())
        .context("Compressing raw data table")?;
    disc_info.raw_data_entries_size.set(compressed_raw_table.len() as u32);

    out.seek(SeekFrom::Start(0)).context("Seeking output to start")?;
    out.write_all(&[0u8; size_of::<FileHeader>()]).context("Reserving header 1")?;
    out.write_all(&[0u8; size_of::<DiscInfo>()]).context("Reserving header 2")?;
    out.write_all(partition_table).context("Writing partition entries")?;
    out.write_all(&compressed_raw_table).context("Writing raw data entries")?;
    let mut file_pos = raw_data_offset + compressed_raw_table.len() as u64;
    pad_to_4(out, &mut file_pos).context("Aligning group data")?;

    let ctx = ConvertContext {
        rvz,
        compression,
        chunk_size: options.chunk_size,
        disc_id: plan.disc_id,
        disc_num: plan.disc_num,
        reuse: Mutex::new(Default::default()),
    };
    let mut digest = DigestManager::new(&options.digests);

    let mut groups = vec![RvzGroupEntry::default(); plan.total_groups as usize];
    let mut progress = ProgressInfo {
        total_groups: plan.total_groups,
        bytes_written: file_pos,
        ..Default::default()
    };
    run_pipeline(
        source,
        &plan.jobs,
        &ctx,
        &mut digest,
        options.processor_threads,
        |output: JobOutput| -> Result<()> {
            for (i, entry) in output.entries.into_iter().enumerate() {
                let group_index = output.first_group as usize + i;
                let mut group = entry.group;
                let mut write_data = !entry.reused && group.data_size() != 0;
                if write_data {
                    if let Some(id) = &entry.reuse_id {
                        // A racing worker may have stored this group already
                        if let Some(stored) = ctx.reuse.lock().unwrap().get(id) {
                            group = stored.clone();
                            write_data = false;
                        }
                    }
                }
                if write_data {
                    pad_to_4(out, &mut file_pos).context("Aligning group data")?;
                    group.data_offset.set((file_pos / 4) as u32);
                    out.write_all(&entry.data)
                        .with_context(|| format!("Writing group {}", group_index))?;
                    file_pos += entry.data.len() as u64;
                    if let Some(id) = entry.reuse_id {
                        ctx.reuse.lock().unwrap().entry(id).or_insert_with(|| group.clone());
                    }
                }
                groups[group_index] = group;
                progress.groups_written += 1;
            }
            progress.bytes_read += output.disc_size as u64;
            progress.bytes_written = file_pos;
            if let Some(callback) = callback.as_deref_mut() {
                if !callback(&progress) {
                    return Err(Error::Cancelled);
                }
            }
            Ok(())
        },
    )?;

    // Group entry table, compressed like the raw-data table
    pad_to_4(out, &mut file_pos).context("Aligning group table")?;
    disc_info.group_entries_offset.set(file_pos);
    let group_table = if rvz {
        Bytes::copy_from_slice(groups.as_slice().as_bytes())
    } else {
        let mut buf = BytesMut::with_capacity(groups.len() * size_of::<GroupEntry>());
        for group in &groups {
            if group.rvz_packed_size.get() != 0 {
                return Err(Error::Other("RVZ packed group in WIA".to_string()));
            }
            buf.put_slice(GroupEntry::from(group).as_bytes());
        }
        buf.freeze()
    };
    let compressed_group_table =
        compress_table(compression, &group_table).context("Compressing group table")?;
    disc_info.group_entries_size.set(compressed_group_table.len() as u32);
    out.write_all(&compressed_group_table).context("Writing group table")?;
    file_pos += compressed_group_table.len() as u64;

    // Back-patch the headers: partition table hash is already in header 2,
    // header 2's hash goes in header 1, and header 1 hashes itself last
    let mut header = FileHeader::new_zeroed();
    header.magic = if rvz { RVZ_MAGIC } else { WIA_MAGIC };
    header.version.set(if rvz { RVZ_VERSION } else { WIA_VERSION });
    header
        .version_compatible
        .set(if rvz { RVZ_VERSION_WRITE_COMPATIBLE } else { WIA_VERSION_WRITE_COMPATIBLE });
    header.disc_info_size.set(size_of::<DiscInfo>() as u32);
    header.disc_info_hash = sha1_hash(disc_info.as_bytes());
    header.iso_file_size.set(iso_size);
    header.container_size.set(file_pos);
    let header_hash = sha1_hash(&header.as_bytes()[..size_of::<FileHeader>() - 20]);
    header.header_hash = header_hash;

    out.seek(SeekFrom::Start(0)).context("Seeking to header")?;
    out.write_all(header.as_bytes()).context("Writing header 1")?;
    out.write_all(disc_info.as_bytes()).context("Writing header 2")?;
    out.flush().context("Flushing output")?;

    let digests = digest.finish();
    Ok(ConversionSummary {
        groups_written: plan.total_groups,
        bytes_written: file_pos,
        crc32: digests.crc32,
        md5: digests.md5,
        sha1: digests.sha1,
        xxh64: digests.xxh64,
    })
}

fn validate_config(format: Format, compression: Compression, chunk_size: u32) -> Result<()> {
    let rvz = format == Format::Rvz;
    if rvz {
        let valid_small = chunk_size >= SECTOR_SIZE as u32
            && chunk_size < 0x200000
            && chunk_size.is_power_of_two();
        if !valid_small && (chunk_size == 0 || chunk_size % 0x200000 != 0) {
            return Err(Error::Other(format!("Invalid RVZ chunk size: {:#X}", chunk_size)));
        }
    } else if chunk_size < 0x200000 || chunk_size % 0x200000 != 0 {
        return Err(Error::Other(format!("Invalid WIA chunk size: {:#X}", chunk_size)));
    }
    if rvz && compression == Compression::Purge {
        return Err(Error::Other("Purge compression is not valid in RVZ".to_string()));
    }
    if !rvz && matches!(compression, Compression::Zstandard(_)) {
        return Err(Error::Other("Zstandard compression is not valid in WIA".to_string()));
    }
    Ok(())
}

/// Walks the volume and builds the partition/raw-data entry tables, group
/// index assignments, and the pipeline job list.
fn plan_conversion(
    source: &mut dyn DiscStream,
    volume: Option<&dyn DiscVolume>,
    iso_size: u64,
    chunk_size: u32,
) -> Result<Plan> {
    let mut disc_head = [0u8; DISC_HEAD_SIZE];
    if let Some(volume) = volume {
        disc_head = volume.disc_head();
    } else if iso_size > 0 {
        source.seek(SeekFrom::Start(0)).context("Seeking to disc head")?;
        let n = iso_size.min(DISC_HEAD_SIZE as u64) as usize;
        source.read_exact(&mut disc_head[..n]).context("Reading disc head")?;
    }
    let is_wii = match volume {
        Some(volume) => volume.is_wii(),
        None => disc_head[0x18..0x1C] == [0x5D, 0x1C, 0x9E, 0xA3],
    };
    let (disc_id, disc_num) = match volume {
        Some(volume) => (volume.disc_id(), volume.disc_num()),
        None => (*crate::util::array_ref![disc_head, 0, 4], disc_head[6]),
    };
    let partitions: Vec<PartitionView> = volume.map(|v| v.partitions()).unwrap_or_default();

    let chunk_sectors = chunk_size / SECTOR_SIZE as u32;
    // Both partition data areas must start on hash group and chunk
    // boundaries
    let split_align = chunk_sectors.max(SECTORS_PER_GROUP as u32);
    let mut plan = Plan {
        disc_type: if is_wii { DiscKind::Wii } else { DiscKind::GameCube },
        disc_head,
        disc_id,
        disc_num,
        partition_entries: Vec::with_capacity(partitions.len()),
        raw_data_entries: Vec::new(),
        total_groups: 0,
        jobs: Vec::new(),
    };

    let mut pos = DISC_HEAD_SIZE as u64;
    for partition in &partitions {
        let part_start = partition.data_start_sector as u64 * SECTOR_SIZE as u64;
        let part_end = partition.data_end_sector as u64 * SECTOR_SIZE as u64;
        if part_start < pos || part_end > iso_size || part_start > part_end {
            return Err(Error::Other(format!(
                "Partition data {:#X}..{:#X} out of range",
                part_start, part_end
            )));
        }
        add_raw_region(&mut plan, pos, part_start, chunk_size)?;

        let num_sectors = partition.num_sectors();
        let management_sectors = partition
            .management_end_sector
            .saturating_sub(partition.data_start_sector)
            .max(1)
            .align_up(split_align)
            .min(num_sectors);
        let mut entry = PartitionEntry {
            partition_key: partition.key,
            data_entries: [PartitionDataEntry::default(), PartitionDataEntry::default()],
        };
        let areas = [
            (partition.data_start_sector, management_sectors),
            (partition.data_start_sector + management_sectors, num_sectors - management_sectors),
        ];
        for (i, &(first_sector, area_sectors)) in areas.iter().enumerate() {
            entry.data_entries[i].first_sector.set(first_sector);
            entry.data_entries[i].num_sectors.set(area_sectors);
            if area_sectors == 0 {
                continue;
            }
            let num_groups = area_sectors.div_ceil(chunk_sectors);
            entry.data_entries[i].group_index.set(plan.total_groups);
            entry.data_entries[i].num_groups.set(num_groups);
            add_partition_jobs(
                &mut plan,
                partition,
                first_sector,
                area_sectors,
                chunk_sectors,
            );
            plan.total_groups += num_groups;
        }
        plan.partition_entries.push(entry);
        pos = part_end;
    }
    add_raw_region(&mut plan, pos, iso_size, chunk_size)?;
    Ok(plan)
}

fn add_raw_region(plan: &mut Plan, start: u64, end: u64, chunk_size: u32) -> Result<()> {
    if end <= start {
        return Ok(());
    }
    let rounded_start = start.align_down(SECTOR_SIZE as u64);
    let num_groups = (end - rounded_start).div_ceil(chunk_size as u64) as u32;
    let mut entry = RawDataEntry::default();
    entry.raw_data_offset.set(start);
    entry.raw_data_size.set(end - start);
    entry.group_index.set(plan.total_groups);
    entry.num_groups.set(num_groups);
    plan.raw_data_entries.push(entry);

    let mut chunk_start = rounded_start;
    let mut group = plan.total_groups;
    while chunk_start < end {
        let chunk_end = (chunk_start + chunk_size as u64).min(end);
        plan.jobs.push(JobSpec {
            first_group: group,
            disc_offset: chunk_start,
            disc_size: (chunk_end - chunk_start) as usize,
            zero_head: start.saturating_sub(chunk_start) as usize,
            kind: JobKind::Raw,
        });
        group += 1;
        chunk_start = chunk_end;
    }
    plan.total_groups += num_groups;
    Ok(())
}

fn add_partition_jobs(
    plan: &mut Plan,
    partition: &PartitionView,
    first_sector: u32,
    area_sectors: u32,
    chunk_sectors: u32,
) {
    // One job per chunk, or per Wii sector group when chunks are smaller
    // (the hash machinery works on whole sector groups)
    let job_sectors = chunk_sectors.max(SECTORS_PER_GROUP as u32);
    let mut sector = first_sector;
    let mut group = plan.total_groups;
    while sector < first_sector + area_sectors {
        let end = (sector + job_sectors).min(first_sector + area_sectors);
        plan.jobs.push(JobSpec {
            first_group: group,
            disc_offset: sector as u64 * SECTOR_SIZE as u64,
            disc_size: (end - sector) as usize * SECTOR_SIZE,
            zero_head: 0,
            kind: JobKind::Partition {
                key: partition.key,
                data_start_sector: partition.data_start_sector,
            },
        });
        group += (end - sector).div_ceil(chunk_sectors);
        sector = end;
    }
}

/// Runs the producer/worker/collector pipeline. `on_output` is invoked on
/// the calling thread, in job submission order.
fn run_pipeline(
    source: &mut dyn DiscStream,
    jobs: &[JobSpec],
    ctx: &ConvertContext,
    digest: &mut DigestManager,
    num_threads: usize,
    mut on_output: impl FnMut(JobOutput) -> Result<()>,
) -> Result<()> {
    if num_threads == 0 {
        let mut state = WorkerState::new(ctx)?;
        for (job_index, job) in jobs.iter().enumerate() {
            let data = read_job_data(source, job, digest)
                .with_context(|| format!("Reading source for job {job_index}"))?;
            let entries = process_job(&mut state, ctx, job, data)
                .with_context(|| format!("Processing job {job_index}"))?;
            on_output(JobOutput {
                job_index,
                first_group: job.first_group,
                entries,
                disc_size: job.disc_size,
            })?;
        }
        return Ok(());
    }

    let mut states = Vec::with_capacity(num_threads);
    for _ in 0..num_threads {
        states.push(WorkerState::new(ctx)?);
    }

    std::thread::scope(|s| -> Result<()> {
        let (job_tx, job_rx) =
            crossbeam_channel::bounded::<io::Result<(usize, &JobSpec, Bytes)>>(num_threads * 2);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<Result<JobOutput>>(0);

        s.spawn(move || {
            for (job_index, job) in jobs.iter().enumerate() {
                let result = read_job_data(source, job, digest).map(|data| (job_index, job, data));
                let failed = result.is_err();
                if job_tx.send(result).is_err() || failed {
                    break;
                }
            }
        });

        for mut state in states {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let result = job
                        .map_err(|e| e.context("Reading source image"))
                        .and_then(|(job_index, job, data)| {
                            let entries = process_job(&mut state, ctx, job, data)
                                .with_context(|| format!("Processing job {job_index}"))?;
                            Ok(JobOutput {
                                job_index,
                                first_group: job.first_group,
                                entries,
                                disc_size: job.disc_size,
                            })
                        });
                    let failed = result.is_err();
                    if result_tx.send(result).is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(result_tx);

        // Collector: re-serialize worker output into submission order
        let mut current_job = 0usize;
        let mut out_of_order = VecDeque::<JobOutput>::new();
        while let Ok(result) = result_rx.recv() {
            let output = result?;
            if output.job_index == current_job {
                on_output(output)?;
                current_job += 1;
                while out_of_order.front().is_some_and(|o| o.job_index == current_job) {
                    on_output(out_of_order.pop_front().unwrap())?;
                    current_job += 1;
                }
            } else {
                match out_of_order.binary_search_by_key(&output.job_index, |o| o.job_index) {
                    Ok(_) => {
                        return Err(Error::Other(format!(
                            "Unexpected duplicate job {}",
                            output.job_index
                        )))
                    }
                    Err(idx) => out_of_order.insert(idx, output),
                }
            }
        }
        if current_job != jobs.len() {
            return Err(Error::Other("Pipeline stopped early".to_string()));
        }
        Ok(())
    })
}

/// Reads one job's disc bytes, feeding the digests the original data
/// before the disc-head region is zeroed out.
fn read_job_data(
    source: &mut dyn DiscStream,
    job: &JobSpec,
    digest: &mut DigestManager,
) -> io::Result<Bytes> {
    source.seek(SeekFrom::Start(job.disc_offset))?;
    let mut buf = BytesMut::zeroed(job.disc_size);
    source.read_exact(&mut buf)?;
    digest.update(&buf);
    if job.zero_head > 0 {
        buf[..job.zero_head].fill(0);
    }
    Ok(buf.freeze())
}

impl WorkerState {
    fn new(ctx: &ConvertContext) -> Result<Self> {
        // Sized so compression always succeeds; RVZ discards oversized
        // output by comparing against the stored-raw alternative
        let lists_bound = (ctx.chunk_size as usize).div_ceil(SECTOR_GROUP_SIZE)
            * (2 + MAX_HASH_EXCEPTIONS_PER_LIST * size_of::<HashException>());
        let capacity =
            compress_bound(ctx.compression, ctx.chunk_size as usize + lists_bound + 0x40);
        Ok(Self {
            compressor: Compressor::new(ctx.compression, capacity)?,
            lfg: LaggedFibonacci::default(),
            plaintext: <[u8; SECTOR_GROUP_SIZE]>::new_box_zeroed()?,
        })
    }
}

fn process_job(
    state: &mut WorkerState,
    ctx: &ConvertContext,
    job: &JobSpec,
    data: Bytes,
) -> io::Result<Vec<GroupOut>> {
    match &job.kind {
        JobKind::Raw => {
            let entry = finish_entry(
                state,
                ctx,
                &[],
                &data,
                job.disc_offset,
                None,
                true,
            )?;
            Ok(vec![entry])
        }
        JobKind::Partition { key, data_start_sector } => {
            process_partition_job(state, ctx, job, &data, key, *data_start_sector)
        }
    }
}

/// Decrypts a partition job, derives hash exceptions per sector group, and
/// emits one entry per chunk.
fn process_partition_job(
    state: &mut WorkerState,
    ctx: &ConvertContext,
    job: &JobSpec,
    data: &[u8],
    key: &KeyBytes,
    data_start_sector: u32,
) -> io::Result<Vec<GroupOut>> {
    if data.len() % SECTOR_SIZE != 0 {
        return Err(io::Error::other("Partition job not aligned to sector size"));
    }
    let sectors = data.len() / SECTOR_SIZE;
    let chunk_sectors = ctx.chunk_size as usize / SECTOR_SIZE;
    let first_sector = (job.disc_offset / SECTOR_SIZE as u64) as u32;

    // Payload bytes and per-sector-group exceptions for the whole job
    let mut payload = BytesMut::zeroed(sectors * SECTOR_DATA_SIZE);
    let num_wii_groups = sectors.div_ceil(SECTORS_PER_GROUP);
    let mut group_exceptions: Vec<Vec<HashException>> = vec![Vec::new(); num_wii_groups];
    for wg in 0..num_wii_groups {
        let wg_sectors = (sectors - wg * SECTORS_PER_GROUP).min(SECTORS_PER_GROUP);
        state.plaintext.fill(0);
        for s in 0..wg_sectors {
            let sector = wg * SECTORS_PER_GROUP + s;
            decrypt_sector_b2b(
                crate::util::array_ref![data, sector * SECTOR_SIZE, SECTOR_SIZE],
                crate::util::array_ref_mut![state.plaintext, s * SECTOR_SIZE, SECTOR_SIZE],
                key,
            );
        }
        let hashes = hash_sector_group(&state.plaintext);
        for s in 0..wg_sectors {
            let sector = wg * SECTORS_PER_GROUP + s;
            let canonical = canonical_hash_block(&hashes, s);
            derive_sector_exceptions(
                crate::util::array_ref![state.plaintext, s * SECTOR_SIZE, HASHES_SIZE],
                &canonical,
                s,
                &mut group_exceptions[wg],
            );
            payload[sector * SECTOR_DATA_SIZE..(sector + 1) * SECTOR_DATA_SIZE].copy_from_slice(
                &state.plaintext[s * SECTOR_SIZE + HASHES_SIZE..(s + 1) * SECTOR_SIZE],
            );
        }
    }
    let payload = payload.freeze();

    let mut entries = Vec::new();
    if chunk_sectors >= SECTORS_PER_GROUP {
        // One chunk per job; one exception list per 2 MiB of the chunk,
        // empty lists included for short jobs
        let lists_per_chunk = ctx.chunk_size as usize / SECTOR_GROUP_SIZE;
        let mut lists = group_exceptions;
        lists.resize(lists_per_chunk, Vec::new());
        let junk_offset =
            (first_sector - data_start_sector) as u64 * SECTOR_DATA_SIZE as u64;
        entries.push(finish_entry(
            state,
            ctx,
            &lists,
            &payload,
            junk_offset,
            Some(*key),
            true,
        )?);
    } else {
        // The job is one Wii sector group split into several chunks, each
        // carrying one exception list rebased to its own first hash
        let exceptions = &group_exceptions[0];
        let num_chunks = sectors.div_ceil(chunk_sectors);
        for c in 0..num_chunks {
            let chunk_first = c * chunk_sectors;
            let chunk_end = ((c + 1) * chunk_sectors).min(sectors);
            let base = chunk_first * HASHES_SIZE;
            let end = chunk_end * HASHES_SIZE;
            let list: Vec<HashException> = exceptions
                .iter()
                .filter(|e| (e.offset.get() as usize) >= base && (e.offset.get() as usize) < end)
                .map(|e| HashException {
                    offset: ((e.offset.get() as usize - base) as u16).into(),
                    hash: e.hash,
                })
                .collect();
            let junk_offset = (first_sector - data_start_sector) as u64
                * SECTOR_DATA_SIZE as u64
                + (chunk_first * SECTOR_DATA_SIZE) as u64;
            entries.push(finish_entry(
                state,
                ctx,
                &[list],
                &payload[chunk_first * SECTOR_DATA_SIZE..chunk_end * SECTOR_DATA_SIZE],
                junk_offset,
                Some(*key),
                false,
            )?);
        }
    }
    Ok(entries)
}

fn serialize_exception_lists(lists: &[Vec<HashException>]) -> BytesMut {
    let mut buf = BytesMut::new();
    for list in lists {
        buf.put_u16(list.len() as u16);
        for exception in list {
            buf.put_slice(exception.as_bytes());
        }
    }
    buf
}

/// Runs one group's payload through zero elision, reuse detection, RVZ
/// packing, and compression, producing its stored bytes and group entry.
fn finish_entry(
    state: &mut WorkerState,
    ctx: &ConvertContext,
    lists: &[Vec<HashException>],
    payload: &[u8],
    junk_offset: u64,
    key: Option<KeyBytes>,
    allow_junk_reuse: bool,
) -> io::Result<GroupOut> {
    let lists_empty = lists.iter().all(|list| list.is_empty());
    if lists_empty && payload.iter().all(|&b| b == 0) {
        return Ok(GroupOut {
            group: RvzGroupEntry::default(),
            data: Bytes::new(),
            reuse_id: None,
            reused: false,
        });
    }

    let reuse_id = if lists_empty && !payload.is_empty() && payload.iter().all(|&b| b == payload[0])
    {
        Some(ReuseID {
            partition_key: key,
            data_size: payload.len() as u64,
            encrypted: false,
            value: payload[0],
        })
    } else {
        None
    };
    if let Some(id) = &reuse_id {
        if let Some(stored) = ctx.reuse.lock().unwrap().get(id) {
            return Ok(GroupOut {
                group: stored.clone(),
                data: Bytes::new(),
                reuse_id: reuse_id.clone(),
                reused: true,
            });
        }
    }

    let packed = if ctx.rvz {
        rvz_pack(payload, junk_offset, ctx.disc_id, ctx.disc_num, allow_junk_reuse, &mut state.lfg)
    } else {
        None
    };
    let rvz_packed_size = packed.as_ref().map_or(0, |p| p.len() as u32);
    let store_payload: &[u8] = packed.as_deref().unwrap_or(payload);

    let mut lists_bytes = serialize_exception_lists(lists);
    let raw_lists_len = lists_bytes.len();

    match ctx.compression {
        Compression::None | Compression::Purge => {
            // Lists are stored uncompressed, 4-byte aligned as a whole
            lists_bytes.resize(raw_lists_len.align_up(4), 0);
            let mut data = BytesMut::from(lists_bytes.as_ref());
            if ctx.compression == Compression::Purge {
                state.compressor.start()?;
                state.compressor.add_preceding_data(&lists_bytes);
                if !state.compressor.compress(store_payload)? || !state.compressor.end()? {
                    return Err(io::Error::other("Purge output exceeded bounds"));
                }
                data.put_slice(state.compressor.bytes());
            } else {
                data.put_slice(store_payload);
            }
            let size = data.len() as u32;
            Ok(GroupOut {
                group: entry_for(size, false, rvz_packed_size),
                data: data.freeze(),
                reuse_id,
                reused: false,
            })
        }
        _ => {
            state.compressor.start()?;
            let fit = state.compressor.compress(&lists_bytes[..raw_lists_len])?
                && state.compressor.compress(store_payload)?
                && state.compressor.end()?;
            if !fit {
                return Err(io::Error::other("Compressed output exceeded bounds"));
            }
            let compressed_size = state.compressor.bytes().len();
            let uncompressed_size = raw_lists_len.align_up(4) + store_payload.len();
            if !ctx.rvz || compressed_size.align_up(4) < uncompressed_size {
                Ok(GroupOut {
                    group: entry_for(compressed_size as u32, true, rvz_packed_size),
                    data: Bytes::copy_from_slice(state.compressor.bytes()),
                    reuse_id,
                    reused: false,
                })
            } else {
                // RVZ stores the group raw when compression does not help
                lists_bytes.resize(raw_lists_len.align_up(4), 0);
                let mut data = BytesMut::from(lists_bytes.as_ref());
                data.put_slice(store_payload);
                let size = data.len() as u32;
                Ok(GroupOut {
                    group: entry_for(size, false, rvz_packed_size),
                    data: data.freeze(),
                    reuse_id,
                    reused: false,
                })
            }
        }
    }
}

fn entry_for(data_size: u32, compressed: bool, rvz_packed_size: u32) -> RvzGroupEntry {
    let mut entry = RvzGroupEntry::default();
    entry.data_size_and_flag.set(data_size | if compressed { 0x80000000 } else { 0 });
    entry.rvz_packed_size.set(rvz_packed_size);
    entry
}

/// Compresses an entry table with the container codec. Tables must always
/// fit, so the buffer is sized to the worst case.
fn compress_table(compression: Compression, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut compressor = Compressor::new(compression, compress_bound(compression, data.len()))
        .map_err(|e| io::Error::other(e.to_string()))?;
    compressor.start()?;
    if !compressor.compress(data)? || !compressor.end()? {
        return Err(io::Error::other("Failed to compress entry table"));
    }
    Ok(compressor.bytes().to_vec())
}

fn pad_to_4<W>(out: &mut W, file_pos: &mut u64) -> io::Result<()>
where W: Write {
    let rem = (*file_pos % 4) as usize;
    if rem != 0 {
        out.write_all(&[0u8; 4][..4 - rem])?;
        *file_pos += (4 - rem) as u64;
    }
    Ok(())
}
