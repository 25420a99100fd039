//! Content digests for the artifact upload pipeline.
//!
//! The wire format is a base64-encoded 128-bit MD5, matching the backend's
//! `ETag`-equivalent digest convention. This module also exposes a streaming
//! hasher so the checksum stage can digest a file without holding its full
//! contents in memory.

use base64::Engine;
use std::fmt::Display;
use std::io::{self, Read, Write};

/// A base64-encoded 128-bit MD5 digest, as carried on `ManifestEntry.digest`
/// and used as the local cache's content-address key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    /// Digest of `data` in one shot.
    pub fn new(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Raw 16-byte digest.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex encoding, used for multipart `completedParts[].hexMD5`.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a base64-encoded digest as produced by [`ContentDigest::to_string`].
    pub fn from_base64(s: &str) -> Result<Self, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| e.to_string())?;
        if bytes.len() != 16 {
            return Err(format!("expected 16-byte MD5 digest, got {} bytes", bytes.len()));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", base64::engine::general_purpose::STANDARD.encode(self.0))
    }
}

/// Streaming MD5 hasher; `Write`-compatible so it can sit behind a
/// `std::io::copy` sink.
#[derive(Default, Clone)]
pub struct StreamingDigest(md5::Context);

impl StreamingDigest {
    pub fn new() -> Self {
        Self(md5::Context::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.compute().0)
    }
}

impl Write for StreamingDigest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Digest an entire reader without loading it into memory at once.
pub fn digest_reader(mut reader: impl Read) -> io::Result<ContentDigest> {
    let mut hasher = StreamingDigest::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_md5_vector() {
        let digest = ContentDigest::new(b"Hello, world!");
        // md5("Hello, world!") = 6cd3556deb0da54bca060b4c39479839
        assert_eq!(digest.to_hex(), "6cd3556deb0da54bca060b4c39479839");
    }

    #[test]
    fn base64_round_trips() {
        let digest = ContentDigest::new(b"round trip me");
        let encoded = digest.to_string();
        let decoded = ContentDigest::from_base64(&encoded).unwrap();
        assert_eq!(digest, decoded);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"some longer content that spans multiple reads perhaps";
        let one_shot = ContentDigest::new(data);
        let streamed = digest_reader(std::io::Cursor::new(data)).unwrap();
        assert_eq!(one_shot, streamed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ContentDigest::from_base64("dG9vc2hvcnQ=").is_err());
    }
}
