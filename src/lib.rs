#![warn(missing_docs)]
//! Library for reading & writing the WIA and RVZ disc image container
//! formats (GameCube and Wii).
//!
//! Both formats store the disc image in compressed chunks, with Wii
//! partition data held decrypted and stripped of its hash blocks; hashes
//! are recomputed on read and corrected with stored exceptions so the
//! original image is reproduced bit for bit. RVZ additionally recognizes
//! the consoles' pseudo-random junk filler and stores only its seed.
//!
//! # Examples
//!
//! Reading from a container:
//!
//! ```no_run
//! use discpack::WiaReader;
//!
//! let file = std::fs::File::open("game.rvz").expect("Failed to open file");
//! let mut reader = WiaReader::new(Box::new(std::io::BufReader::new(file)))
//!     .expect("Failed to open container");
//! let mut buf = vec![0u8; 0x100];
//! reader.read(0x2440, &mut buf).expect("Failed to read");
//! ```
//!
//! Converting a raw image:
//!
//! ```no_run
//! use discpack::{convert, common::Format, ConvertOptions};
//!
//! let mut source = std::fs::File::open("game.iso").expect("Failed to open source");
//! let mut out = std::fs::File::create("game.rvz").expect("Failed to create output");
//! let mut options = ConvertOptions::new(Format::Rvz);
//! options.processor_threads = 4;
//! let summary = convert(&mut source, None, &mut out, &options, None)
//!     .expect("Conversion failed");
//! println!("Wrote {} bytes", summary.bytes_written);
//! ```

pub(crate) mod chunk;
pub mod common;
pub(crate) mod compress;
pub(crate) mod digest;
pub mod format;
pub mod lfg;
pub(crate) mod pack;
pub mod reader;
mod util;
pub mod volume;
pub mod wii;
pub mod writer;

pub use digest::DigestOptions;
pub use reader::WiaReader;
pub use volume::{DiscStream, DiscVolume, PartitionView};
pub use writer::{convert, ConversionSummary, ConvertOptions, ProgressInfo};

/// Error type for container operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed input: bad magic, version, size, hash, or table contents.
    #[error("disc format error: {0}")]
    DiscFormat(String),
    /// A codec reported an error or an inconsistent stream.
    #[error("codec error: {0}")]
    Codec(String),
    /// The container is shorter than its headers declare.
    #[error("truncated container: {0}")]
    Truncated(String),
    /// An underlying I/O error.
    #[error("{0}")]
    Io(String, #[source] std::io::Error),
    /// The progress callback requested cancellation.
    #[error("cancelled")]
    Cancelled,
    /// An internal invariant was violated.
    #[error("error: {0}")]
    Other(String),
}

impl From<&str> for Error {
    #[inline]
    fn from(s: &str) -> Error { Error::Other(s.to_string()) }
}

impl From<String> for Error {
    #[inline]
    fn from(s: String) -> Error { Error::Other(s) }
}

impl From<zerocopy::AllocError> for Error {
    #[inline]
    fn from(_: zerocopy::AllocError) -> Error {
        Error::Io(
            "allocation failed".to_string(),
            std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        )
    }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for std::io::Error {
    fn context(self, context: impl Into<String>) -> Error {
        match self.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Truncated(format!("{}: {}", context.into(), self))
            }
            std::io::ErrorKind::InvalidData => {
                Error::Codec(format!("{}: {}", context.into(), self))
            }
            _ => Error::Io(context.into(), self),
        }
    }
}

impl ErrorContext for Error {
    fn context(self, context: impl Into<String>) -> Error {
        match self {
            Error::DiscFormat(msg) => Error::DiscFormat(format!("{}: {}", context.into(), msg)),
            Error::Codec(msg) => Error::Codec(format!("{}: {}", context.into(), msg)),
            Error::Truncated(msg) => Error::Truncated(format!("{}: {}", context.into(), msg)),
            Error::Io(msg, e) => Error::Io(format!("{}: {}", context.into(), msg), e),
            Error::Cancelled => Error::Cancelled,
            Error::Other(msg) => Error::Other(format!("{}: {}", context.into(), msg)),
        }
    }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}
