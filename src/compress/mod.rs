//! Streaming codec adapters.
//!
//! Every codec is driven through the same contract: input is an append-only
//! buffer with a consumer cursor, output is an append-only buffer, errors
//! are sticky, and `done()` reports end-of-stream. This keeps the chunk
//! cache and the write pipeline codec-agnostic.

use std::io;

use zerocopy::FromZeros;

use crate::{
    common::Compression,
    pack::RvzPackDecompressor,
    Error, Result,
};

#[cfg(feature = "compress-lzma")]
pub mod lzma;
pub mod purge;

use purge::{PurgeCompressor, PurgeDecompressor};

/// An append-only byte log with a fixed capacity. The producer advances
/// `bytes_written`; consumers track their own read cursors.
pub struct DecompressionBuffer {
    pub data: Box<[u8]>,
    pub bytes_written: usize,
}

impl DecompressionBuffer {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let data = <[u8]>::new_box_zeroed_with_elems(capacity)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self { data, bytes_written: 0 })
    }

    /// The written prefix.
    #[inline]
    pub fn filled(&self) -> &[u8] { &self.data[..self.bytes_written] }

    /// Remaining capacity.
    #[inline]
    pub fn space(&self) -> usize { self.data.len() - self.bytes_written }
}

/// A streaming decompressor for one group or table blob.
///
/// Construct with [`Decompressor::new`]; once a call fails, every
/// subsequent call fails with the same kind of error.
pub struct Decompressor {
    state: DecompressorState,
    failed: bool,
}

pub(crate) enum DecompressorState {
    None { done: bool },
    Purge(PurgeDecompressor),
    #[cfg(feature = "compress-bzip2")]
    Bzip2 {
        stream: bzip2::Decompress,
        done: bool,
    },
    #[cfg(feature = "compress-lzma")]
    Lzma {
        stream: liblzma::stream::Stream,
        done: bool,
    },
    #[cfg(feature = "compress-zstd")]
    Zstd {
        ctx: zstd_safe::DCtx<'static>,
        done: bool,
    },
    /// RVZ junk-run framing layered over another decompressor; see
    /// [`crate::pack`].
    RvzPack(Box<RvzPackDecompressor>),
}

impl Decompressor {
    /// Creates a decompressor for the given compression configuration.
    /// `decompressed_size` is only significant for Purge.
    pub fn new(
        compression: Compression,
        compressor_data: &[u8],
        decompressed_size: usize,
    ) -> Result<Self> {
        let state = match compression {
            Compression::None => DecompressorState::None { done: false },
            Compression::Purge => {
                DecompressorState::Purge(PurgeDecompressor::new(decompressed_size))
            }
            #[cfg(feature = "compress-bzip2")]
            Compression::Bzip2(_) => DecompressorState::Bzip2 {
                stream: bzip2::Decompress::new(false),
                done: false,
            },
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma(_) => {
                let options = lzma::lzma_props_decode(compressor_data)
                    .map_err(|e| Error::DiscFormat(format!("Invalid LZMA props: {}", e)))?;
                DecompressorState::Lzma {
                    stream: lzma::new_lzma_decoder(&options)
                        .map_err(|e| Error::DiscFormat(format!("Creating LZMA decoder: {}", e)))?,
                    done: false,
                }
            }
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma2(_) => {
                let options = lzma::lzma2_props_decode(compressor_data)
                    .map_err(|e| Error::DiscFormat(format!("Invalid LZMA2 props: {}", e)))?;
                DecompressorState::Lzma {
                    stream: lzma::new_lzma2_decoder(&options)
                        .map_err(|e| Error::DiscFormat(format!("Creating LZMA2 decoder: {}", e)))?,
                    done: false,
                }
            }
            #[cfg(feature = "compress-zstd")]
            Compression::Zstandard(_) => DecompressorState::Zstd {
                ctx: zstd_safe::DCtx::create(),
                done: false,
            },
            #[allow(unreachable_patterns)] // if compression features are disabled
            comp => {
                return Err(Error::DiscFormat(format!(
                    "Compression {} support is disabled",
                    comp
                )))
            }
        };
        Ok(Self { state, failed: false })
    }

    /// Replaces this decompressor with a fresh no-op one, returning the
    /// original. Used when re-homing the decoder inside the pack wrapper.
    pub(crate) fn take(&mut self) -> Decompressor {
        Decompressor {
            state: std::mem::replace(&mut self.state, DecompressorState::None { done: false }),
            failed: self.failed,
        }
    }

    /// Wraps this decompressor with the RVZ junk-run decoder. `backlog` is
    /// the already-decompressed tail (past the exception lists), and
    /// `data_offset` the group's offset within the junk position space.
    pub(crate) fn wrap_rvz_pack(
        self,
        backlog: DecompressionBuffer,
        backlog_read: usize,
        data_offset: u64,
    ) -> Self {
        Self {
            state: DecompressorState::RvzPack(Box::new(RvzPackDecompressor::new(
                self,
                backlog,
                backlog_read,
                data_offset,
            ))),
            failed: false,
        }
    }

    /// Feeds available input to the codec, appending decompressed bytes to
    /// `out`. `in_bytes_read` advances past consumed input.
    pub fn decompress(
        &mut self,
        input: &DecompressionBuffer,
        in_bytes_read: &mut usize,
        out: &mut DecompressionBuffer,
    ) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Decompressor already failed"));
        }
        let result = self.state.decompress(input, in_bytes_read, out);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Whether the codec has reached end-of-stream.
    pub fn done(&self) -> bool { !self.failed && self.state.done() }
}

impl DecompressorState {
    fn decompress(
        &mut self,
        input: &DecompressionBuffer,
        in_bytes_read: &mut usize,
        out: &mut DecompressionBuffer,
    ) -> io::Result<()> {
        match self {
            DecompressorState::None { done } => {
                let n = (input.bytes_written - *in_bytes_read).min(out.space());
                out.data[out.bytes_written..out.bytes_written + n]
                    .copy_from_slice(&input.data[*in_bytes_read..*in_bytes_read + n]);
                out.bytes_written += n;
                *in_bytes_read += n;
                if *in_bytes_read == input.data.len() {
                    *done = true;
                    Ok(())
                } else if out.space() > 0 || input.bytes_written == *in_bytes_read {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Decompressed data too large",
                    ))
                }
            }
            DecompressorState::Purge(purge) => purge.decompress(input, in_bytes_read, out),
            #[cfg(feature = "compress-bzip2")]
            DecompressorState::Bzip2 { stream, done } => {
                if *done {
                    return Ok(());
                }
                let before_in = stream.total_in();
                let before_out = stream.total_out();
                let status = stream
                    .decompress(
                        &input.data[*in_bytes_read..input.bytes_written],
                        &mut out.data[out.bytes_written..],
                    )
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                *in_bytes_read += (stream.total_in() - before_in) as usize;
                out.bytes_written += (stream.total_out() - before_out) as usize;
                if status == bzip2::Status::StreamEnd {
                    *done = true;
                }
                Ok(())
            }
            #[cfg(feature = "compress-lzma")]
            DecompressorState::Lzma { stream, done } => {
                if *done {
                    return Ok(());
                }
                let before_in = stream.total_in();
                let before_out = stream.total_out();
                let status = stream
                    .process(
                        &input.data[*in_bytes_read..input.bytes_written],
                        &mut out.data[out.bytes_written..],
                        liblzma::stream::Action::Run,
                    )
                    .map_err(io::Error::other)?;
                *in_bytes_read += (stream.total_in() - before_in) as usize;
                out.bytes_written += (stream.total_out() - before_out) as usize;
                if status == liblzma::stream::Status::StreamEnd {
                    *done = true;
                }
                Ok(())
            }
            #[cfg(feature = "compress-zstd")]
            DecompressorState::Zstd { ctx, done } => {
                if *done {
                    return Ok(());
                }
                let mut in_buffer =
                    zstd_safe::InBuffer::around(&input.data[*in_bytes_read..input.bytes_written]);
                let (written, consumed, hint) = {
                    let dst = &mut out.data[out.bytes_written..];
                    let mut out_buffer = zstd_safe::OutBuffer::around(dst);
                    let hint = ctx
                        .decompress_stream(&mut out_buffer, &mut in_buffer)
                        .map_err(|code| {
                            io::Error::new(
                                io::ErrorKind::InvalidData,
                                zstd_safe::get_error_name(code),
                            )
                        })?;
                    (out_buffer.pos(), in_buffer.pos, hint)
                };
                *in_bytes_read += consumed;
                out.bytes_written += written;
                if hint == 0 {
                    *done = true;
                }
                Ok(())
            }
            DecompressorState::RvzPack(pack) => pack.decompress(input, in_bytes_read, out),
        }
    }

    fn done(&self) -> bool {
        match self {
            DecompressorState::None { done } => *done,
            DecompressorState::Purge(purge) => purge.done(),
            #[cfg(feature = "compress-bzip2")]
            DecompressorState::Bzip2 { done, .. } => *done,
            #[cfg(feature = "compress-lzma")]
            DecompressorState::Lzma { done, .. } => *done,
            #[cfg(feature = "compress-zstd")]
            DecompressorState::Zstd { done, .. } => *done,
            DecompressorState::RvzPack(pack) => pack.done(),
        }
    }
}

/// A compressor for one group.
///
/// Call `start`, then `compress` any number of times, then `end`; the
/// compressed bytes are available from `bytes`. The output never grows past
/// the configured capacity: `compress`/`end` return `false` when it would,
/// letting RVZ fall back to storing the group raw.
pub struct Compressor {
    pub kind: Compression,
    state: CompressorState,
    capacity: usize,
}

enum CompressorState {
    None {
        buffer: Vec<u8>,
    },
    Purge(PurgeCompressor),
    #[cfg(feature = "compress-bzip2")]
    Bzip2 {
        stream: Option<bzip2::Compress>,
        buffer: Vec<u8>,
    },
    #[cfg(feature = "compress-lzma")]
    Lzma {
        lzma2: bool,
        stream: Option<liblzma::stream::Stream>,
        buffer: Vec<u8>,
    },
    #[cfg(feature = "compress-zstd")]
    Zstd {
        ctx: zstd_safe::CCtx<'static>,
        pending: Vec<u8>,
        buffer: Vec<u8>,
    },
}

impl Compressor {
    /// Creates a compressor whose output is capped at `capacity` bytes.
    pub fn new(kind: Compression, capacity: usize) -> Result<Self> {
        let state = match kind {
            Compression::None => CompressorState::None { buffer: Vec::with_capacity(capacity) },
            Compression::Purge => CompressorState::Purge(PurgeCompressor::new(capacity)),
            #[cfg(feature = "compress-bzip2")]
            Compression::Bzip2(_) => CompressorState::Bzip2 {
                stream: None,
                buffer: Vec::with_capacity(capacity),
            },
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma(_) => CompressorState::Lzma {
                lzma2: false,
                stream: None,
                buffer: Vec::with_capacity(capacity),
            },
            #[cfg(feature = "compress-lzma")]
            Compression::Lzma2(_) => CompressorState::Lzma {
                lzma2: true,
                stream: None,
                buffer: Vec::with_capacity(capacity),
            },
            #[cfg(feature = "compress-zstd")]
            Compression::Zstandard(_) => CompressorState::Zstd {
                ctx: zstd_safe::CCtx::create(),
                pending: Vec::with_capacity(capacity),
                buffer: Vec::with_capacity(capacity),
            },
            #[allow(unreachable_patterns)] // if compression features are disabled
            comp => return Err(Error::Other(format!("Compression {} support is disabled", comp))),
        };
        Ok(Self { kind, state, capacity })
    }

    /// Resets state for a new group.
    pub fn start(&mut self) -> io::Result<()> {
        let level = self.kind.level();
        match &mut self.state {
            CompressorState::None { buffer } => buffer.clear(),
            CompressorState::Purge(purge) => purge.start(),
            #[cfg(feature = "compress-bzip2")]
            CompressorState::Bzip2 { stream, buffer } => {
                buffer.clear();
                *stream = Some(bzip2::Compress::new(bzip2::Compression::new(level as u32), 30));
            }
            #[cfg(feature = "compress-lzma")]
            CompressorState::Lzma { lzma2, stream, buffer } => {
                buffer.clear();
                let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
                *stream = Some(if *lzma2 {
                    lzma::new_lzma2_encoder(&options)?
                } else {
                    lzma::new_lzma_encoder(&options)?
                });
            }
            #[cfg(feature = "compress-zstd")]
            CompressorState::Zstd { ctx, pending, buffer } => {
                pending.clear();
                buffer.clear();
                ctx.init(level).map_err(map_zstd_error)?;
                ctx.set_parameter(zstd_safe::CParameter::ContentSizeFlag(true))
                    .map_err(map_zstd_error)?;
            }
        }
        Ok(())
    }

    /// Folds data into the Purge hash without storing it. No-op for every
    /// other codec.
    pub fn add_preceding_data(&mut self, data: &[u8]) {
        if let CompressorState::Purge(purge) = &mut self.state {
            purge.add_preceding_data(data);
        }
    }

    /// Compresses a chunk of input. Returns `false` if the output exceeded
    /// the capacity.
    pub fn compress(&mut self, data: &[u8]) -> io::Result<bool> {
        let capacity = self.capacity;
        match &mut self.state {
            CompressorState::None { buffer } => {
                if buffer.len() + data.len() > capacity {
                    return Ok(false);
                }
                buffer.extend_from_slice(data);
                Ok(true)
            }
            CompressorState::Purge(purge) => purge.compress(data),
            #[cfg(feature = "compress-bzip2")]
            CompressorState::Bzip2 { stream, buffer } => {
                let stream = stream
                    .as_mut()
                    .ok_or_else(|| io::Error::other("Compressor not started"))?;
                let mut consumed = 0usize;
                while consumed < data.len() {
                    if buffer.len() == capacity {
                        return Ok(false);
                    }
                    let len = buffer.len();
                    buffer.resize(capacity, 0);
                    let before_in = stream.total_in();
                    let before_out = stream.total_out();
                    let result = stream.compress(
                        &data[consumed..],
                        &mut buffer[len..],
                        bzip2::Action::Run,
                    );
                    consumed += (stream.total_in() - before_in) as usize;
                    buffer.truncate(len + (stream.total_out() - before_out) as usize);
                    result.map_err(io::Error::other)?;
                }
                Ok(true)
            }
            #[cfg(feature = "compress-lzma")]
            CompressorState::Lzma { stream, buffer, .. } => {
                let stream = stream
                    .as_mut()
                    .ok_or_else(|| io::Error::other("Compressor not started"))?;
                let mut consumed = 0usize;
                while consumed < data.len() {
                    if buffer.len() == capacity {
                        return Ok(false);
                    }
                    let len = buffer.len();
                    buffer.resize(capacity, 0);
                    let before_in = stream.total_in();
                    let before_out = stream.total_out();
                    let result = stream.process(
                        &data[consumed..],
                        &mut buffer[len..],
                        liblzma::stream::Action::Run,
                    );
                    consumed += (stream.total_in() - before_in) as usize;
                    buffer.truncate(len + (stream.total_out() - before_out) as usize);
                    result.map_err(io::Error::other)?;
                }
                Ok(true)
            }
            #[cfg(feature = "compress-zstd")]
            CompressorState::Zstd { pending, .. } => {
                // Buffered and compressed in one shot by `end`
                pending.extend_from_slice(data);
                Ok(true)
            }
        }
    }

    /// Finishes the stream. Returns `false` if the output exceeded the
    /// capacity.
    pub fn end(&mut self) -> io::Result<bool> {
        let capacity = self.capacity;
        match &mut self.state {
            CompressorState::None { .. } => Ok(true),
            CompressorState::Purge(purge) => purge.end(),
            #[cfg(feature = "compress-bzip2")]
            CompressorState::Bzip2 { stream, buffer } => {
                let mut stream = stream
                    .take()
                    .ok_or_else(|| io::Error::other("Compressor not started"))?;
                loop {
                    if buffer.len() == capacity {
                        return Ok(false);
                    }
                    let len = buffer.len();
                    buffer.resize(capacity, 0);
                    let before_out = stream.total_out();
                    let result =
                        stream.compress(&[], &mut buffer[len..], bzip2::Action::Finish);
                    buffer.truncate(len + (stream.total_out() - before_out) as usize);
                    match result.map_err(io::Error::other)? {
                        bzip2::Status::StreamEnd => return Ok(true),
                        _ => continue,
                    }
                }
            }
            #[cfg(feature = "compress-lzma")]
            CompressorState::Lzma { stream, buffer, .. } => {
                let mut stream = stream
                    .take()
                    .ok_or_else(|| io::Error::other("Compressor not started"))?;
                loop {
                    if buffer.len() == capacity {
                        return Ok(false);
                    }
                    let len = buffer.len();
                    buffer.resize(capacity, 0);
                    let before_out = stream.total_out();
                    let result = stream.process(
                        &[],
                        &mut buffer[len..],
                        liblzma::stream::Action::Finish,
                    );
                    buffer.truncate(len + (stream.total_out() - before_out) as usize);
                    if result.map_err(io::Error::other)? == liblzma::stream::Status::StreamEnd {
                        return Ok(true);
                    }
                }
            }
            #[cfg(feature = "compress-zstd")]
            CompressorState::Zstd { ctx, pending, buffer } => {
                buffer.clear();
                match ctx.compress2(buffer, pending) {
                    Ok(_) => Ok(true),
                    // dstSize_tooSmall
                    Err(e) if e == -70isize as usize => Ok(false),
                    Err(e) => Err(map_zstd_error(e)),
                }
            }
        }
    }

    /// The finished output.
    pub fn bytes(&self) -> &[u8] {
        match &self.state {
            CompressorState::None { buffer } => buffer,
            CompressorState::Purge(purge) => purge.bytes(),
            #[cfg(feature = "compress-bzip2")]
            CompressorState::Bzip2 { buffer, .. } => buffer,
            #[cfg(feature = "compress-lzma")]
            CompressorState::Lzma { buffer, .. } => buffer,
            #[cfg(feature = "compress-zstd")]
            CompressorState::Zstd { buffer, .. } => buffer,
        }
    }
}

/// Builds the codec parameter blob stored in header 2.
pub fn compressor_data(compression: Compression) -> io::Result<Box<[u8]>> {
    match compression {
        #[cfg(feature = "compress-lzma")]
        Compression::Lzma(level) => {
            let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
            Ok(Box::new(lzma::lzma_props_encode(&options)?))
        }
        #[cfg(feature = "compress-lzma")]
        Compression::Lzma2(level) => {
            let options = liblzma::stream::LzmaOptions::new_preset(level as u32)?;
            Ok(Box::new(lzma::lzma2_props_encode(&options)?))
        }
        _ => Ok(Box::default()),
    }
}

/// Worst-case output size for compressing `size` bytes, used to size the
/// output buffer when the format requires compression to succeed (WIA).
pub fn compress_bound(compression: Compression, size: usize) -> usize {
    match compression {
        Compression::None => size,
        Compression::Purge => size + 0x40,
        Compression::Bzip2(_) => {
            // 1.25 * size
            size.div_ceil(4) + size + 0x100
        }
        Compression::Lzma(_) => {
            // 1.1 * size + 64 KiB
            size.div_ceil(10) + size + 64000
        }
        Compression::Lzma2(_) => {
            // 1.001 * size + 1 KiB
            size.div_ceil(1000) + size + 1000
        }
        #[cfg(feature = "compress-zstd")]
        Compression::Zstandard(_) => zstd_safe::compress_bound(size),
        #[allow(unreachable_patterns)]
        _ => size * 2 + 0x10000,
    }
}

#[cfg(feature = "compress-zstd")]
fn map_zstd_error(code: usize) -> io::Error {
    io::Error::other(zstd_safe::get_error_name(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress_all(kind: Compression, data: &[u8], capacity: usize) -> Option<Vec<u8>> {
        let mut compressor = Compressor::new(kind, capacity).unwrap();
        compressor.start().unwrap();
        if !compressor.compress(data).unwrap() || !compressor.end().unwrap() {
            return None;
        }
        Some(compressor.bytes().to_vec())
    }

    fn decompress_all(
        kind: Compression,
        compressor_data: &[u8],
        stored: &[u8],
        decompressed_size: usize,
    ) -> Vec<u8> {
        let mut input = DecompressionBuffer::new(stored.len()).unwrap();
        let mut out = DecompressionBuffer::new(decompressed_size).unwrap();
        let mut decompressor = Decompressor::new(kind, compressor_data, decompressed_size).unwrap();
        let mut in_bytes_read = 0usize;
        // Feed the input a little at a time to exercise the streaming path
        let mut fed = 0usize;
        while !decompressor.done() && out.bytes_written < decompressed_size {
            if fed < stored.len() {
                let n = 0x100.min(stored.len() - fed);
                input.data[fed..fed + n].copy_from_slice(&stored[fed..fed + n]);
                fed += n;
                input.bytes_written = fed;
            }
            decompressor.decompress(&input, &mut in_bytes_read, &mut out).unwrap();
            if matches!(kind, Compression::None) && in_bytes_read == stored.len() {
                break;
            }
        }
        assert_eq!(out.bytes_written, decompressed_size);
        out.filled().to_vec()
    }

    fn test_payload() -> Vec<u8> {
        let mut data = vec![0u8; 0x8000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i / 0x100) ^ (i % 0x40)) as u8;
        }
        data[0x4000..0x5000].fill(0);
        data
    }

    #[test]
    fn test_none_round_trip() {
        let data = test_payload();
        let stored = compress_all(Compression::None, &data, data.len()).unwrap();
        assert_eq!(stored, data);
        assert_eq!(decompress_all(Compression::None, &[], &stored, data.len()), data);
    }

    #[test]
    fn test_purge_round_trip() {
        let data = test_payload();
        let stored = compress_all(Compression::Purge, &data, data.len() + 0x40).unwrap();
        assert!(stored.len() < data.len());
        assert_eq!(decompress_all(Compression::Purge, &[], &stored, data.len()), data);
    }

    #[cfg(feature = "compress-bzip2")]
    #[test]
    fn test_bzip2_round_trip() {
        let data = test_payload();
        let stored =
            compress_all(Compression::Bzip2(9), &data, compress_bound(Compression::Bzip2(9), data.len()))
                .unwrap();
        assert_eq!(decompress_all(Compression::Bzip2(9), &[], &stored, data.len()), data);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_lzma_round_trip() {
        let data = test_payload();
        let props = compressor_data(Compression::Lzma(6)).unwrap();
        let stored =
            compress_all(Compression::Lzma(6), &data, compress_bound(Compression::Lzma(6), data.len()))
                .unwrap();
        assert_eq!(decompress_all(Compression::Lzma(6), &props, &stored, data.len()), data);
    }

    #[cfg(feature = "compress-lzma")]
    #[test]
    fn test_lzma2_round_trip() {
        let data = test_payload();
        let props = compressor_data(Compression::Lzma2(6)).unwrap();
        let stored = compress_all(
            Compression::Lzma2(6),
            &data,
            compress_bound(Compression::Lzma2(6), data.len()),
        )
        .unwrap();
        assert_eq!(decompress_all(Compression::Lzma2(6), &props, &stored, data.len()), data);
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_zstd_round_trip() {
        let data = test_payload();
        let stored = compress_all(
            Compression::Zstandard(3),
            &data,
            compress_bound(Compression::Zstandard(3), data.len()),
        )
        .unwrap();
        assert_eq!(decompress_all(Compression::Zstandard(3), &[], &stored, data.len()), data);
    }

    #[cfg(feature = "compress-zstd")]
    #[test]
    fn test_zstd_capacity_exceeded() {
        // Incompressible input with a tight capacity must report false, not
        // error: RVZ stores such groups raw.
        let mut data = vec![0u8; 0x1000];
        let mut state = 0x12345678u32;
        for b in data.iter_mut() {
            state = state.wrapping_mul(0x41C64E6D).wrapping_add(12345);
            *b = (state >> 16) as u8;
        }
        assert!(compress_all(Compression::Zstandard(3), &data, 0x100).is_none());
    }

    #[test]
    fn test_sticky_failure() {
        let mut input = DecompressionBuffer::new(0x40).unwrap();
        input.bytes_written = 0x40;
        let mut out = DecompressionBuffer::new(0x100).unwrap();
        let mut decompressor = Decompressor::new(Compression::Purge, &[], 0x100).unwrap();
        // Segment claiming to extend past the decompressed size
        input.data[0..4].copy_from_slice(&0x200u32.to_be_bytes());
        input.data[4..8].copy_from_slice(&0x100u32.to_be_bytes());
        let mut in_bytes_read = 0usize;
        assert!(decompressor.decompress(&input, &mut in_bytes_read, &mut out).is_err());
        // Sticky: still fails with valid-looking input
        assert!(decompressor.decompress(&input, &mut in_bytes_read, &mut out).is_err());
    }
}
