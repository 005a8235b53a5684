//! Source-image digests computed alongside a conversion.
//!
//! The pipeline's producer is the only thread that sees the source bytes
//! in disc order, so the enabled hashers are driven sequentially from
//! there, one update per job.

/// Which digests to compute during a conversion.
#[derive(Default, Debug, Clone)]
pub struct DigestOptions {
    /// CRC32 of the source image.
    pub crc32: bool,
    /// MD5 of the source image. (Slow!)
    pub md5: bool,
    /// SHA-1 of the source image.
    pub sha1: bool,
    /// XXH64 of the source image.
    pub xxh64: bool,
}

pub(crate) struct DigestManager {
    hashers: Vec<Box<dyn Hasher + Send>>,
}

impl DigestManager {
    pub fn new(options: &DigestOptions) -> Self {
        let mut hashers: Vec<Box<dyn Hasher + Send>> = Vec::new();
        if options.crc32 {
            hashers.push(Box::new(crc32fast::Hasher::new()));
        }
        if options.md5 {
            hashers.push(Box::new(<md5::Md5 as digest::Digest>::new()));
        }
        if options.sha1 {
            hashers.push(Box::new(<sha1::Sha1 as digest::Digest>::new()));
        }
        if options.xxh64 {
            hashers.push(Box::new(xxhash_rust::xxh64::Xxh64::new(0)));
        }
        DigestManager { hashers }
    }

    pub fn update(&mut self, data: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(data);
        }
    }

    pub fn finish(self) -> DigestResults {
        let mut results = DigestResults::default();
        for hasher in self.hashers {
            hasher.finish(&mut results);
        }
        results
    }
}

#[derive(Default)]
pub(crate) struct DigestResults {
    pub crc32: Option<u32>,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    pub xxh64: Option<u64>,
}

trait Hasher {
    fn update(&mut self, data: &[u8]);
    fn finish(self: Box<Self>, results: &mut DigestResults);
}

impl Hasher for crc32fast::Hasher {
    fn update(&mut self, data: &[u8]) { crc32fast::Hasher::update(self, data) }

    fn finish(self: Box<Self>, results: &mut DigestResults) {
        results.crc32 = Some(self.finalize());
    }
}

impl Hasher for md5::Md5 {
    fn update(&mut self, data: &[u8]) { digest::Digest::update(self, data) }

    fn finish(self: Box<Self>, results: &mut DigestResults) {
        results.md5 = Some(digest::Digest::finalize(*self).into());
    }
}

impl Hasher for sha1::Sha1 {
    fn update(&mut self, data: &[u8]) { digest::Digest::update(self, data) }

    fn finish(self: Box<Self>, results: &mut DigestResults) {
        results.sha1 = Some(digest::Digest::finalize(*self).into());
    }
}

impl Hasher for xxhash_rust::xxh64::Xxh64 {
    fn update(&mut self, data: &[u8]) { xxhash_rust::xxh64::Xxh64::update(self, data) }

    fn finish(self: Box<Self>, results: &mut DigestResults) {
        results.xxh64 = Some(self.digest());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests_match_one_shot() {
        let data: Vec<u8> = (0..0x2000u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut manager = DigestManager::new(&DigestOptions {
            crc32: true,
            md5: false,
            sha1: true,
            xxh64: true,
        });
        // Split across updates; the results must match hashing in one shot
        manager.update(&data[..0x123]);
        manager.update(&data[0x123..]);
        let results = manager.finish();
        assert_eq!(results.crc32, Some(crc32fast::hash(&data)));
        assert_eq!(results.xxh64, Some(xxhash_rust::xxh64::xxh64(&data, 0)));
        assert_eq!(
            results.sha1.as_ref(),
            Some(&crate::wii::sha1_hash(&data))
        );
        assert!(results.md5.is_none());
    }

    #[test]
    fn test_no_digests() {
        let mut manager = DigestManager::new(&DigestOptions::default());
        manager.update(&[1, 2, 3]);
        let results = manager.finish();
        assert!(results.crc32.is_none());
        assert!(results.sha1.is_none());
        assert!(results.xxh64.is_none());
    }
}
