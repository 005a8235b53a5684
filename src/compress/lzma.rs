//! LZMA/LZMA2 codec parameter handling in the 7-Zip SDK format used by the
//! container, plus raw encoder/decoder construction.

use std::{
    cmp::Ordering,
    io::{Error, ErrorKind, Result},
};

use liblzma::stream::{Filters, LzmaOptions, Stream};

use crate::util::{array_ref, array_ref_mut, static_assert};

/// Decodes the LZMA properties byte (lc/lp/pb).
pub fn lzma_lclppb_decode(options: &mut LzmaOptions, byte: u8) -> Result<()> {
    let mut d = byte as u32;
    if d >= (9 * 5 * 5) {
        return Err(Error::new(ErrorKind::InvalidData, format!("Invalid LZMA props byte: {}", d)));
    }
    options.literal_context_bits(d % 9);
    d /= 9;
    options.position_bits(d / 5);
    options.literal_position_bits(d % 5);
    Ok(())
}

/// Encodes the LZMA properties byte (lc/lp/pb).
pub fn lzma_lclppb_encode(options: &LzmaOptions) -> Result<u8> {
    let options = get_options_sys(options);
    let byte = (options.pb * 5 + options.lp) * 9 + options.lc;
    if byte >= (9 * 5 * 5) {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid LZMA props byte: {}", byte),
        ));
    }
    Ok(byte as u8)
}

/// Decodes the 5-byte LZMA properties blob: the lc/lp/pb byte followed by
/// the dictionary size in little endian.
pub fn lzma_props_decode(props: &[u8]) -> Result<LzmaOptions> {
    if props.len() != 5 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid LZMA props length: {}", props.len()),
        ));
    }
    let mut options = LzmaOptions::new();
    lzma_lclppb_decode(&mut options, props[0])?;
    options.dict_size(u32::from_le_bytes(*array_ref![props, 1, 4]));
    Ok(options)
}

/// Encodes the 5-byte LZMA properties blob.
pub fn lzma_props_encode(options: &LzmaOptions) -> Result<[u8; 5]> {
    let mut props = [0u8; 5];
    props[0] = lzma_lclppb_encode(options)?;
    *array_ref_mut![props, 1, 4] = get_options_sys(options).dict_size.to_le_bytes();
    Ok(props)
}

/// Decodes the 1-byte LZMA2 dictionary size code:
/// `p < 40` expands to `(2 | (p & 1)) << (p / 2 + 11)`, `p == 40` to
/// `u32::MAX`.
pub fn lzma2_props_decode(props: &[u8]) -> Result<LzmaOptions> {
    if props.len() != 1 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid LZMA2 props length: {}", props.len()),
        ));
    }
    let d = props[0] as u32;
    let mut options = LzmaOptions::new();
    options.dict_size(match d.cmp(&40) {
        Ordering::Greater => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid LZMA2 props byte: {}", d),
            ));
        }
        Ordering::Equal => u32::MAX,
        Ordering::Less => (2 | (d & 1)) << (d / 2 + 11),
    });
    Ok(options)
}

/// Encodes the 1-byte LZMA2 dictionary size code.
pub fn lzma2_props_encode(options: &LzmaOptions) -> Result<[u8; 1]> {
    let options = get_options_sys(options);
    let mut d = options.dict_size.max(liblzma_sys::LZMA_DICT_SIZE_MIN);

    // Round up to the next 2^n - 1 or 2^n + 2^(n-1) - 1, whichever is next
    d -= 1;
    d |= d >> 2;
    d |= d >> 3;
    d |= d >> 4;
    d |= d >> 8;
    d |= d >> 16;

    if d == u32::MAX {
        d = 40;
    } else {
        d = get_dist_slot(d + 1) - 24;
    }

    Ok([d as u8])
}

/// Creates a new raw LZMA decoder with the given options.
pub fn new_lzma_decoder(options: &LzmaOptions) -> Result<Stream> {
    let mut filters = Filters::new();
    filters.lzma1(options);
    Stream::new_raw_decoder(&filters).map_err(Error::from)
}

/// Creates a new raw LZMA encoder with the given options.
pub fn new_lzma_encoder(options: &LzmaOptions) -> Result<Stream> {
    let mut filters = Filters::new();
    filters.lzma1(options);
    Stream::new_raw_encoder(&filters).map_err(Error::from)
}

/// Creates a new raw LZMA2 decoder with the given options.
pub fn new_lzma2_decoder(options: &LzmaOptions) -> Result<Stream> {
    let mut filters = Filters::new();
    filters.lzma2(options);
    Stream::new_raw_decoder(&filters).map_err(Error::from)
}

/// Creates a new raw LZMA2 encoder with the given options.
pub fn new_lzma2_encoder(options: &LzmaOptions) -> Result<Stream> {
    let mut filters = Filters::new();
    filters.lzma2(options);
    Stream::new_raw_encoder(&filters).map_err(Error::from)
}

/// liblzma does not expose accessors for `LzmaOptions`, so we view it as
/// the internal `lzma_options_lzma` struct.
#[inline]
fn get_options_sys(options: &LzmaOptions) -> &liblzma_sys::lzma_options_lzma {
    static_assert!(size_of::<LzmaOptions>() == size_of::<liblzma_sys::lzma_options_lzma>());
    unsafe { &*(options as *const LzmaOptions as *const liblzma_sys::lzma_options_lzma) }
}

/// See `get_dist_slot` in liblzma's `fastpos.h`.
fn get_dist_slot(dist: u32) -> u32 {
    if dist <= 4 {
        dist
    } else {
        let i = dist.leading_zeros() ^ 31;
        (i + i) + ((dist >> (i - 1)) & 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lzma_props_round_trip() {
        let options = LzmaOptions::new_preset(6).unwrap();
        let props = lzma_props_encode(&options).unwrap();
        let decoded = lzma_props_decode(&props).unwrap();
        assert_eq!(lzma_props_encode(&decoded).unwrap(), props);
    }

    #[test]
    fn test_lzma2_dict_size_code() {
        // p < 40 expands to (2 | (p & 1)) << (p / 2 + 11)
        let mut options = LzmaOptions::new();
        options.dict_size((2 | (7 & 1)) << (7 / 2 + 11));
        assert_eq!(lzma2_props_encode(&options).unwrap(), [7]);
        options.dict_size(u32::MAX);
        assert_eq!(lzma2_props_encode(&options).unwrap(), [40]);
        assert!(lzma2_props_decode(&[41]).is_err());
    }

    #[test]
    fn test_invalid_lzma_props() {
        assert!(lzma_props_decode(&[0xE1, 0, 0, 0, 1]).is_err());
        assert!(lzma_props_decode(&[0x5D, 0, 0]).is_err());
    }
}
