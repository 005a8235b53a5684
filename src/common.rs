//! Common types.

use std::{fmt, ops::RangeInclusive, str::FromStr};

use crate::{Error, Result};

/// SHA-1 hash bytes
pub type HashBytes = [u8; 20];

/// AES key bytes
pub type KeyBytes = [u8; 16];

/// Magic bytes
pub type MagicBytes = [u8; 4];

/// The container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// WIA (Wii ISO Archive)
    #[default]
    Wia,
    /// RVZ (extended WIA with junk-data elision)
    Rvz,
}

impl Format {
    /// Returns the default chunk size for the format.
    #[inline]
    pub fn default_chunk_size(self) -> u32 {
        match self {
            Format::Wia => crate::writer::WIA_DEFAULT_CHUNK_SIZE,
            Format::Rvz => crate::writer::RVZ_DEFAULT_CHUNK_SIZE,
        }
    }

    /// Returns the default compression algorithm for the format.
    #[inline]
    pub fn default_compression(self) -> Compression {
        match self {
            Format::Wia => crate::writer::WIA_DEFAULT_COMPRESSION,
            Format::Rvz => crate::writer::RVZ_DEFAULT_COMPRESSION,
        }
    }
}

impl fmt::Display for Format {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Wia => write!(f, "WIA"),
            Format::Rvz => write!(f, "RVZ"),
        }
    }
}

/// The compression algorithm applied to group data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression
    #[default]
    None,
    /// Zero-run elision with a SHA-1 integrity tag (WIA only)
    Purge,
    /// BZIP2
    Bzip2(u8),
    /// LZMA
    Lzma(u8),
    /// LZMA2
    Lzma2(u8),
    /// Zstandard (RVZ only)
    Zstandard(i8),
}

impl Compression {
    /// Returns the closed range of compression levels accepted by the
    /// algorithm. Algorithms without levels return `0..=0`.
    pub fn allowed_levels(self) -> RangeInclusive<i32> {
        match self {
            Compression::None | Compression::Purge => 0..=0,
            Compression::Bzip2(_) => 1..=9,
            Compression::Lzma(_) | Compression::Lzma2(_) => 0..=9,
            Compression::Zstandard(_) => 1..=22,
        }
    }

    /// The configured compression level.
    #[inline]
    pub fn level(self) -> i32 {
        match self {
            Compression::None | Compression::Purge => 0,
            Compression::Bzip2(level) => level as i32,
            Compression::Lzma(level) => level as i32,
            Compression::Lzma2(level) => level as i32,
            Compression::Zstandard(level) => level as i32,
        }
    }

    /// Validates the compression level. Sets the default level if the level is 0.
    pub fn validate_level(&mut self) -> Result<()> {
        match self {
            Compression::Bzip2(level) => {
                if *level == 0 {
                    *level = 9;
                }
            }
            Compression::Lzma(level) | Compression::Lzma2(level) => {
                if *level == 0 {
                    *level = 6;
                }
            }
            Compression::Zstandard(level) => {
                if *level == 0 {
                    *level = 19;
                }
            }
            _ => {}
        }
        let range = self.allowed_levels();
        let level = self.level();
        if !range.contains(&level) {
            return Err(Error::Other(format!(
                "Invalid {self} compression level: {level} (expected {}-{})",
                range.start(),
                range.end()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "None"),
            Compression::Purge => write!(f, "Purge"),
            Compression::Bzip2(level) => write!(f, "BZIP2 ({level})"),
            Compression::Lzma(level) => write!(f, "LZMA ({level})"),
            Compression::Lzma2(level) => write!(f, "LZMA2 ({level})"),
            Compression::Zstandard(level) => write!(f, "Zstandard ({level})"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (format, level) =
            if let Some((format, level_str)) = s.split_once(':').or_else(|| s.split_once('.')) {
                let level = level_str
                    .parse::<i32>()
                    .map_err(|_| format!("Failed to parse compression level: {level_str:?}"))?;
                (format, level)
            } else {
                (s, 0)
            };
        match format.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "purge" => Ok(Compression::Purge),
            "bz2" | "bzip2" => Ok(Compression::Bzip2(level as u8)),
            "lzma" => Ok(Compression::Lzma(level as u8)),
            "lzma2" | "xz" => Ok(Compression::Lzma2(level as u8)),
            "zst" | "zstd" | "zstandard" => Ok(Compression::Zstandard(level as i8)),
            _ => Err(format!("Unknown compression type: {format:?}")),
        }
    }
}

/// The kind of disc stored in the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscKind {
    /// GameCube disc
    GameCube,
    /// Wii disc
    Wii,
}

impl From<DiscKind> for u32 {
    #[inline]
    fn from(value: DiscKind) -> Self {
        match value {
            DiscKind::GameCube => 1,
            DiscKind::Wii => 2,
        }
    }
}

impl TryFrom<u32> for DiscKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::GameCube),
            2 => Ok(Self::Wii),
            v => Err(Error::DiscFormat(format!("Invalid disc type {}", v))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_levels() {
        assert_eq!(Compression::None.allowed_levels(), 0..=0);
        assert_eq!(Compression::Purge.allowed_levels(), 0..=0);
        assert_eq!(Compression::Bzip2(0).allowed_levels(), 1..=9);
        assert_eq!(Compression::Lzma(0).allowed_levels(), 0..=9);
        assert_eq!(Compression::Lzma2(0).allowed_levels(), 0..=9);
        assert_eq!(Compression::Zstandard(0).allowed_levels(), 1..=22);
    }

    #[test]
    fn test_validate_level_defaults() {
        let mut c = Compression::Zstandard(0);
        c.validate_level().unwrap();
        assert_eq!(c, Compression::Zstandard(19));
        let mut c = Compression::Lzma(0);
        c.validate_level().unwrap();
        assert_eq!(c, Compression::Lzma(6));
        let mut c = Compression::Bzip2(10);
        assert!(c.validate_level().is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Compression::from_str("zstd:19"), Ok(Compression::Zstandard(19)));
        assert_eq!(Compression::from_str("bzip2.9"), Ok(Compression::Bzip2(9)));
        assert_eq!(Compression::from_str("none"), Ok(Compression::None));
        assert!(Compression::from_str("lzop").is_err());
    }
}
