//! External collaborator interfaces: host byte I/O and the disc volume
//! abstraction consumed by the writer.

use std::io::{Read, Seek};

use crate::{
    common::KeyBytes,
    format::{SECTOR_SIZE, DISC_HEAD_SIZE},
};

/// Required trait bounds for container I/O streams.
pub trait DiscStream: Read + Seek + Send {}

impl<T> DiscStream for T where T: Read + Seek + Send + ?Sized {}

/// One Wii partition as described by the source volume.
///
/// Only hashed, encrypted partitions belong here; anything else is treated
/// as raw disc data by the writer.
#[derive(Debug, Clone)]
pub struct PartitionView {
    /// AES-128 title key for the partition data.
    pub key: KeyBytes,
    /// First sector of the encrypted data area. This excludes the partition
    /// header, ticket, TMD, certificate chain, and H3 table.
    pub data_start_sector: u32,
    /// Sector past the end of the encrypted data area.
    pub data_end_sector: u32,
    /// Sector (relative to the disc) at which the partition's management
    /// data (boot, apploader, FST) ends. The writer splits the partition's
    /// two data entries here, after alignment.
    pub management_end_sector: u32,
}

impl PartitionView {
    /// Number of sectors in the data area.
    #[inline]
    pub fn num_sectors(&self) -> u32 { self.data_end_sector - self.data_start_sector }

    /// Whether the given disc offset falls within the data area.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.data_start_sector as u64 * SECTOR_SIZE as u64
            && offset < self.data_end_sector as u64 * SECTOR_SIZE as u64
    }
}

/// The disc volume abstraction: partition layout, key material, and the
/// parameters of the junk-data generator. Implemented by the caller; the
/// writer only ever consumes it from the producer thread.
pub trait DiscVolume {
    /// The first 0x80 bytes of the disc image (stored in header 2).
    fn disc_head(&self) -> [u8; DISC_HEAD_SIZE];

    /// Whether this is a Wii disc (disc type 2) rather than GameCube.
    fn is_wii(&self) -> bool;

    /// The game ID used to seed the junk-data generator.
    fn disc_id(&self) -> [u8; 4];

    /// The disc number used to seed the junk-data generator.
    fn disc_num(&self) -> u8;

    /// Hashed, encrypted partitions in disc order. Empty for GameCube.
    fn partitions(&self) -> Vec<PartitionView>;
}
