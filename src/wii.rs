//! Wii sector crypto and hash machinery: AES-CBC sector encryption, sector
//! group hashing, and derivation/application of hash exceptions.

use std::io;

use tracing::instrument;
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    common::{HashBytes, KeyBytes},
    format::{HashException, SECTOR_GROUP_SIZE, SECTOR_SIZE},
    util::{array_ref, array_ref_mut, div_rem},
};

/// Size in bytes of the hash block at the start of each Wii sector.
pub const HASHES_SIZE: usize = 0x400;

/// Size in bytes of the data area of a Wii sector (excluding hashes).
pub const SECTOR_DATA_SIZE: usize = SECTOR_SIZE - HASHES_SIZE; // 0x7C00

/// Number of sectors in a Wii sector group.
pub const SECTORS_PER_GROUP: usize = 64;

/// Number of H0 hashes per sector.
pub const NUM_H0_HASHES: usize = SECTOR_DATA_SIZE / HASHES_SIZE; // 31

/// Encrypts data in-place using AES-128-CBC with the given key and IV.
pub(crate) fn aes_cbc_encrypt(key: &KeyBytes, iv: &KeyBytes, data: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    let len = data.len();
    <cbc::Encryptor<aes::Aes128>>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .unwrap(); // Safe: len is always a multiple of 16
}

/// Decrypts data buffer-to-buffer using AES-128-CBC with the given key and IV.
pub(crate) fn aes_cbc_decrypt_b2b(key: &KeyBytes, iv: &KeyBytes, data: &[u8], out: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
    <cbc::Decryptor<aes::Aes128>>::new(key.into(), iv.into())
        .decrypt_padded_b2b_mut::<NoPadding>(data, out)
        .unwrap(); // Safe: len is always a multiple of 16
}

/// Encrypts a Wii partition sector in-place.
#[instrument(skip_all)]
pub fn encrypt_sector(out: &mut [u8; SECTOR_SIZE], key: &KeyBytes) {
    aes_cbc_encrypt(key, &[0u8; 16], &mut out[..HASHES_SIZE]);
    // Data IV comes from the encrypted hash block
    let iv = *array_ref![out, 0x3D0, 16];
    aes_cbc_encrypt(key, &iv, &mut out[HASHES_SIZE..]);
}

/// Decrypts a Wii partition sector buffer-to-buffer.
#[instrument(skip_all)]
pub fn decrypt_sector_b2b(data: &[u8; SECTOR_SIZE], out: &mut [u8; SECTOR_SIZE], key: &KeyBytes) {
    // Data IV comes from the encrypted hash block
    let iv = *array_ref![data, 0x3D0, 16];
    aes_cbc_decrypt_b2b(key, &[0u8; 16], &data[..HASHES_SIZE], &mut out[..HASHES_SIZE]);
    aes_cbc_decrypt_b2b(key, &iv, &data[HASHES_SIZE..], &mut out[HASHES_SIZE..]);
}

/// Hashes a byte slice with SHA-1.
pub(crate) fn sha1_hash(buf: &[u8]) -> HashBytes {
    use sha1::Digest;
    HashBytes::from(sha1::Sha1::digest(buf))
}

/// Recalculated hashes for one sector group.
#[derive(Clone, FromZeros)]
pub struct GroupHashes {
    /// Hash of the H2 hashes; stored in the partition's H3 table.
    pub h3_hash: HashBytes,
    /// One hash per 8-sector subgroup.
    pub h2_hashes: [HashBytes; 8],
    /// One hash per sector.
    pub h1_hashes: [HashBytes; 64],
    /// One hash per 0x400 bytes of sector data.
    pub h0_hashes: [HashBytes; 1984],
}

impl GroupHashes {
    /// The H0, H1, and H2 hashes belonging to one sector's hash block.
    #[inline]
    pub fn hashes_for_sector(
        &self,
        sector: usize,
    ) -> (&[HashBytes; 31], &[HashBytes; 8], &[HashBytes; 8]) {
        let h1_hashes = array_ref![self.h1_hashes, sector & !7, 8];
        let h0_hashes = array_ref![self.h0_hashes, sector * 31, 31];
        (h0_hashes, h1_hashes, &self.h2_hashes)
    }

    /// Writes this group's hashes into a sector's hash block. Padding areas
    /// are left untouched; callers zero the block first.
    #[inline]
    pub fn apply(&self, sector_data: &mut [u8; SECTOR_SIZE], sector: usize) {
        let (h0_hashes, h1_hashes, h2_hashes) = self.hashes_for_sector(sector);
        array_ref_mut![sector_data, 0, 0x26C].copy_from_slice(h0_hashes.as_bytes());
        array_ref_mut![sector_data, 0x280, 0xA0].copy_from_slice(h1_hashes.as_bytes());
        array_ref_mut![sector_data, 0x340, 0xA0].copy_from_slice(h2_hashes.as_bytes());
    }
}

/// Recalculates the canonical hashes for a sector group from its data areas.
/// Sectors past the end of a partition must be zero-filled by the caller.
#[instrument(skip_all)]
pub fn hash_sector_group(sector_group: &[u8; SECTOR_GROUP_SIZE]) -> Box<GroupHashes> {
    let mut result = GroupHashes::new_box_zeroed().unwrap();
    for (h2_index, h2_hash) in result.h2_hashes.iter_mut().enumerate() {
        let out_h1_hashes = array_ref_mut![result.h1_hashes, h2_index * 8, 8];
        for (h1_index, h1_hash) in out_h1_hashes.iter_mut().enumerate() {
            let sector = h1_index + h2_index * 8;
            let out_h0_hashes =
                array_ref_mut![result.h0_hashes, sector * NUM_H0_HASHES, NUM_H0_HASHES];
            for (h0_index, h0_hash) in out_h0_hashes.iter_mut().enumerate() {
                *h0_hash = sha1_hash(array_ref![
                    sector_group,
                    sector * SECTOR_SIZE + HASHES_SIZE + h0_index * HASHES_SIZE,
                    HASHES_SIZE
                ]);
            }
            *h1_hash = sha1_hash(out_h0_hashes.as_bytes());
        }
        *h2_hash = sha1_hash(out_h1_hashes.as_bytes());
    }
    result.h3_hash = sha1_hash(result.h2_hashes.as_bytes());
    result
}

/// Serializes the canonical hash block for one sector (hashes plus zero
/// padding).
pub fn canonical_hash_block(hashes: &GroupHashes, sector: usize) -> [u8; HASHES_SIZE] {
    let mut block = [0u8; SECTOR_SIZE];
    hashes.apply(array_ref_mut![block, 0, SECTOR_SIZE], sector);
    *array_ref![block, 0, HASHES_SIZE]
}

/// Derives the hash exceptions for one sector: every place where the
/// original hash block differs from the canonical one, greedily covered by
/// 20-byte entries. Entry offsets are relative to the containing sector
/// group.
pub fn derive_sector_exceptions(
    original: &[u8; HASHES_SIZE],
    canonical: &[u8; HASHES_SIZE],
    sector_in_group: usize,
    out: &mut Vec<HashException>,
) {
    let mut pos = 0usize;
    while pos < HASHES_SIZE {
        if original[pos] == canonical[pos] {
            pos += 1;
            continue;
        }
        let offset = pos.min(HASHES_SIZE - 20);
        out.push(HashException {
            offset: ((sector_in_group * HASHES_SIZE + offset) as u16).into(),
            hash: *array_ref![original, offset, 20],
        });
        pos = offset + 20;
    }
}

/// Overwrites recalculated hashes with the stored exceptions. Offsets are
/// relative to the sector group held in `sector_group`.
pub fn apply_hash_exceptions(
    exceptions: &[HashException],
    sector_group: &mut [u8; SECTOR_GROUP_SIZE],
) -> io::Result<()> {
    for exception in exceptions {
        let (sector, offset) = div_rem(exception.offset.get() as usize, HASHES_SIZE);
        if sector >= SECTORS_PER_GROUP || offset + 20 > HASHES_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid hash exception offset {:#X}", exception.offset.get()),
            ));
        }
        sector_group[sector * SECTOR_SIZE + offset..sector * SECTOR_SIZE + offset + 20]
            .copy_from_slice(&exception.hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> KeyBytes { [0x5A; 16] }

    #[test]
    fn test_sector_crypt_round_trip() {
        let mut sector = <[u8; SECTOR_SIZE]>::new_box_zeroed().unwrap();
        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let original = sector.clone();
        encrypt_sector(&mut sector, &test_key());
        assert_ne!(sector[..64], original[..64]);
        let encrypted = sector.clone();
        let mut decrypted = <[u8; SECTOR_SIZE]>::new_box_zeroed().unwrap();
        decrypt_sector_b2b(&encrypted, &mut decrypted, &test_key());
        assert_eq!(decrypted, original);
    }

    #[test]
    fn test_exception_derive_apply_round_trip() {
        let mut group = <[u8; SECTOR_GROUP_SIZE]>::new_box_zeroed().unwrap();
        for (i, b) in group.iter_mut().enumerate() {
            *b = (i % 7) as u8;
        }
        let hashes = hash_sector_group(&group);

        // Write the canonical hashes, then corrupt a few of them to stand in
        // for a disc whose stored hashes don't match recalculation.
        let mut original = group.clone();
        for sector in 0..SECTORS_PER_GROUP {
            original[sector * SECTOR_SIZE..sector * SECTOR_SIZE + HASHES_SIZE].fill(0);
            hashes.apply(array_ref_mut![original, sector * SECTOR_SIZE, SECTOR_SIZE], sector);
        }
        original[3 * SECTOR_SIZE + 0x10] ^= 0xFF;
        original[3 * SECTOR_SIZE + 0x3FF] ^= 0xFF;
        original[62 * SECTOR_SIZE + 0x280] ^= 0x01;

        let mut exceptions = Vec::new();
        for sector in 0..SECTORS_PER_GROUP {
            let canonical = canonical_hash_block(&hashes, sector);
            derive_sector_exceptions(
                array_ref![original, sector * SECTOR_SIZE, HASHES_SIZE],
                &canonical,
                sector,
                &mut exceptions,
            );
        }
        assert_eq!(exceptions.len(), 3);

        // Rebuild from canonical hashes + exceptions and compare.
        let mut rebuilt = group.clone();
        for sector in 0..SECTORS_PER_GROUP {
            rebuilt[sector * SECTOR_SIZE..sector * SECTOR_SIZE + HASHES_SIZE].fill(0);
            hashes.apply(array_ref_mut![rebuilt, sector * SECTOR_SIZE, SECTOR_SIZE], sector);
        }
        apply_hash_exceptions(&exceptions, &mut rebuilt).unwrap();
        assert_eq!(rebuilt.as_bytes(), original.as_bytes());
    }
}
