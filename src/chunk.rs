//! The chunk cache: one in-progress group decompression, demand-driven.
//!
//! A chunk ingests compressed bytes from the container in blocks, feeds
//! them through the codec, strips the hash exception lists off the front of
//! the stream into a side list, and exposes the remaining payload. The
//! decoder is forward-only; the decoded prefix is retained so earlier
//! offsets can be re-read while the group stays cached.

use std::{
    io,
    io::{Read, Seek},
    mem::size_of,
};

use zerocopy::FromBytes;

use crate::{
    compress::{DecompressionBuffer, Decompressor},
    format::{HashException, MAX_HASH_EXCEPTIONS_PER_LIST},
    util::Align,
    volume::DiscStream,
};

/// How many compressed bytes to pull from the container per request.
const READ_BLOCK: usize = 0x10000;

pub struct Chunk {
    file_offset: u64,
    in_buf: DecompressionBuffer,
    in_bytes_read: usize,
    out: DecompressionBuffer,
    decoder: Decompressor,
    payload_size: usize,
    /// Offset of the payload within `out` when the exception lists travel
    /// inside the compressed stream.
    payload_base: usize,
    num_exception_lists: usize,
    compressed_lists: bool,
    enforce_exception_limit: bool,
    rvz_pack: bool,
    data_offset: u64,
    exceptions: Vec<Vec<HashException>>,
    lists_cursor: usize,
    wrapped: bool,
}

impl Chunk {
    /// Sets up decompression of one group blob.
    ///
    /// `compressed_size` is the stored size including exception lists,
    /// `payload_size` the decoded data size. When `compressed_lists` is
    /// false the lists are read directly from the container (4-byte aligned
    /// as a whole) before codec input begins.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_offset: u64,
        compressed_size: usize,
        payload_size: usize,
        num_exception_lists: usize,
        compressed_lists: bool,
        enforce_exception_limit: bool,
        rvz_pack: bool,
        data_offset: u64,
        decoder: Decompressor,
    ) -> io::Result<Self> {
        let lists_bound = if compressed_lists {
            num_exception_lists
                * (2 + MAX_HASH_EXCEPTIONS_PER_LIST * size_of::<HashException>())
        } else {
            0
        };
        let (decoder, out) = if rvz_pack && !compressed_lists {
            // The packed record stream arrives straight from the codec;
            // wrap it now and decode records into the payload buffer
            (
                decoder.wrap_rvz_pack(
                    DecompressionBuffer::new(compressed_size)?,
                    0,
                    data_offset,
                ),
                DecompressionBuffer::new(payload_size)?,
            )
        } else if compressed_lists {
            // Lists and payload share the codec output; the payload is
            // re-homed after the lists are parsed (RVZ) or exposed at an
            // offset (WIA)
            (decoder, DecompressionBuffer::new(lists_bound + payload_size + 0x2000)?)
        } else {
            (decoder, DecompressionBuffer::new(payload_size)?)
        };
        Ok(Self {
            file_offset,
            in_buf: DecompressionBuffer::new(compressed_size)?,
            in_bytes_read: 0,
            out,
            decoder,
            payload_size,
            payload_base: 0,
            num_exception_lists,
            compressed_lists,
            enforce_exception_limit,
            rvz_pack,
            data_offset,
            exceptions: Vec::with_capacity(num_exception_lists),
            lists_cursor: 0,
            wrapped: rvz_pack && !compressed_lists,
        })
    }

    /// The container offset this chunk was created for, used by the reader
    /// to decide whether the cache slot matches.
    #[inline]
    pub fn file_offset(&self) -> u64 { self.file_offset }

    #[inline]
    fn lists_done(&self) -> bool { self.exceptions.len() == self.num_exception_lists }

    #[inline]
    fn payload_available(&self) -> usize {
        if self.compressed_lists && !self.wrapped && !self.lists_done() {
            return 0;
        }
        self.out.bytes_written - self.payload_base
    }

    /// Copies `out.len()` payload bytes starting at `offset`, decoding
    /// forward as needed.
    pub fn read(
        &mut self,
        file: &mut dyn DiscStream,
        offset: usize,
        out: &mut [u8],
    ) -> io::Result<()> {
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= self.payload_size)
            .ok_or_else(|| io::Error::other("Read past end of group payload"))?;
        while self.payload_available() < end {
            if !self.pump(file)? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Incomplete group data",
                ));
            }
        }
        let base = self.payload_base + offset;
        out.copy_from_slice(&self.out.data[base..base + out.len()]);
        Ok(())
    }

    /// Appends the stored exceptions of one list, offsets shifted by
    /// `additional_offset`. Valid once payload bytes have been read.
    pub fn append_hash_exceptions(
        &self,
        list_index: usize,
        additional_offset: u16,
        out: &mut Vec<HashException>,
    ) -> io::Result<()> {
        let list = self.exceptions.get(list_index).ok_or_else(|| {
            io::Error::other(format!("Hash exception list {} not decoded", list_index))
        })?;
        out.extend(list.iter().map(|exception| HashException {
            offset: (exception.offset.get() + additional_offset).into(),
            hash: exception.hash,
        }));
        Ok(())
    }

    /// One round of work: ingest, parse lists, or decode. Returns whether
    /// any progress was made.
    fn pump(&mut self, file: &mut dyn DiscStream) -> io::Result<bool> {
        // Uncompressed lists come straight from the container, before any
        // codec input
        if !self.compressed_lists && !self.lists_done() {
            if self.parse_exception_lists()? {
                if self.lists_done() {
                    // Payload begins 4-byte aligned after the last list
                    self.lists_cursor = self.lists_cursor.align_up(4);
                    self.in_bytes_read = self.lists_cursor;
                }
                return Ok(true);
            }
            return self.ingest(file);
        }

        // The codec input cursor may sit past the ingested bytes right
        // after the uncompressed lists' alignment padding
        let mut progress = false;
        if self.in_buf.bytes_written >= self.in_bytes_read {
            let in_before = self.in_bytes_read;
            let out_before = self.out.bytes_written;
            self.decoder.decompress(&self.in_buf, &mut self.in_bytes_read, &mut self.out)?;
            progress = self.in_bytes_read != in_before || self.out.bytes_written != out_before;
        }

        if self.compressed_lists && !self.lists_done() {
            progress |= self.parse_exception_lists()?;
            if self.lists_done() {
                self.payload_base = self.lists_cursor;
                if self.rvz_pack {
                    // Hand the codec stream past the lists to the junk-run
                    // decoder and decode records into a fresh payload buffer
                    let backlog = std::mem::replace(
                        &mut self.out,
                        DecompressionBuffer::new(self.payload_size)?,
                    );
                    let backlog_read = self.payload_base;
                    self.payload_base = 0;
                    let decoder = self.decoder.take();
                    self.decoder =
                        decoder.wrap_rvz_pack(backlog, backlog_read, self.data_offset);
                    self.wrapped = true;
                }
            }
        }

        if !progress {
            progress = self.ingest(file)?;
        }
        Ok(progress)
    }

    /// Parses as many exception lists as the buffered bytes allow. Returns
    /// whether the cursor advanced.
    fn parse_exception_lists(&mut self) -> io::Result<bool> {
        let buf = if self.compressed_lists { self.out.filled() } else { self.in_buf.filled() };
        let mut cursor = self.lists_cursor;
        let mut parsed = Vec::new();
        while self.exceptions.len() + parsed.len() < self.num_exception_lists {
            if buf.len() - cursor < 2 {
                break;
            }
            let num_exceptions =
                u16::from_be_bytes(buf[cursor..cursor + 2].try_into().unwrap()) as usize;
            if self.enforce_exception_limit && num_exceptions > MAX_HASH_EXCEPTIONS_PER_LIST {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Too many hash exceptions: {}", num_exceptions),
                ));
            }
            let size = num_exceptions * size_of::<HashException>();
            if buf.len() - cursor - 2 < size {
                break;
            }
            let mut list = Vec::with_capacity(num_exceptions);
            for entry in buf[cursor + 2..cursor + 2 + size].chunks_exact(size_of::<HashException>())
            {
                list.push(HashException::read_from_bytes(entry).unwrap());
            }
            cursor += 2 + size;
            parsed.push(list);
        }
        let progress = cursor != self.lists_cursor || !parsed.is_empty();
        self.lists_cursor = cursor;
        self.exceptions.extend(parsed);
        Ok(progress)
    }

    /// Reads the next block of compressed bytes from the container.
    /// Returns whether any bytes arrived.
    fn ingest(&mut self, file: &mut dyn DiscStream) -> io::Result<bool> {
        let space = self.in_buf.space();
        if space == 0 {
            return Ok(false);
        }
        let n = space.min(READ_BLOCK);
        file.seek(io::SeekFrom::Start(self.file_offset + self.in_buf.bytes_written as u64))?;
        let start = self.in_buf.bytes_written;
        let mut read = 0;
        while read < n {
            let count = file.read(&mut self.in_buf.data[start + read..start + n])?;
            if count == 0 {
                break;
            }
            read += count;
        }
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Container truncated while reading group data",
            ));
        }
        self.in_buf.bytes_written += read;
        Ok(true)
    }
}
