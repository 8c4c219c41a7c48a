//! Magic-byte detection and decompression for upstream feed content.
//!
//! Upstream XMLTV feeds arrive either plain or gzip-compressed, and the
//! transfer headers are not always trustworthy. Detection therefore falls
//! back to magic bytes when headers and file suffix disagree.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;

/// Supported compression formats for playlist/XMLTV content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Uncompressed,
}

/// Magic file detection and decompression utility
pub struct DecompressionService;

impl DecompressionService {
    /// Detect compression format using magic bytes
    pub fn detect_compression_format(data: &[u8]) -> CompressionFormat {
        if let Some(kind) = infer::get(data) {
            match kind.mime_type() {
                "application/gzip" => CompressionFormat::Gzip,
                _ => CompressionFormat::Uncompressed,
            }
        } else {
            CompressionFormat::Uncompressed
        }
    }

    /// Decompress data based on detected format
    pub fn decompress(data: Bytes) -> Result<Vec<u8>> {
        match Self::detect_compression_format(&data) {
            CompressionFormat::Gzip => {
                let mut decoder = GzDecoder::new(data.as_ref());
                let mut decompressed = Vec::new();
                decoder
                    .read_to_end(&mut decompressed)
                    .context("Failed to decompress gzip data")?;
                Ok(decompressed)
            }
            CompressionFormat::Uncompressed => Ok(data.to_vec()),
        }
    }

    /// Open a file for reading, transparently decoding gzip.
    ///
    /// The gzip magic is checked on the file itself rather than trusting
    /// the extension, so a rotated snapshot keeps working even if it was
    /// stored with the wrong suffix.
    pub fn open_maybe_gzip(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let n = file.read(&mut magic)?;
        // Re-open to restart at offset zero for either branch
        let file = File::open(path)?;
        if n == 2 && magic == [0x1f, 0x8b] {
            Ok(Box::new(BufReader::new(GzDecoder::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_detect_uncompressed() {
        let data = b"<?xml version=\"1.0\"?><tv></tv>";
        let format = DecompressionService::detect_compression_format(data);
        assert_eq!(format, CompressionFormat::Uncompressed);
    }

    #[test]
    fn test_detect_and_decompress_gzip() {
        let original = "<?xml version=\"1.0\"?><tv></tv>";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let format = DecompressionService::detect_compression_format(&compressed);
        assert_eq!(format, CompressionFormat::Gzip);

        let decompressed = DecompressionService::decompress(Bytes::from(compressed)).unwrap();
        assert_eq!(String::from_utf8(decompressed).unwrap(), original);
    }

    #[test]
    fn test_open_maybe_gzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let plain_path = dir.path().join("feed.xml");
        std::fs::write(&plain_path, "<tv/>").unwrap();

        let gz_path = dir.path().join("feed.xml.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(b"<tv/>").unwrap();
        std::fs::write(&gz_path, encoder.finish().unwrap()).unwrap();

        for path in [&plain_path, &gz_path] {
            let mut reader = DecompressionService::open_maybe_gzip(path).unwrap();
            let mut content = String::new();
            reader.read_to_string(&mut content).unwrap();
            assert_eq!(content, "<tv/>");
        }
    }
}
