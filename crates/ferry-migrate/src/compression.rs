//! Compression and checksum utilities.
//!
//! Wraps the gzip and zstd stream encoders behind one writer type keyed by
//! [`CompressionFormat`], and provides SHA-256 helpers for files and
//! streams. Zip compresses each entry itself, so its container bytes pass
//! through the stream codecs unchanged.

use ferry_core::types::CompressionFormat;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Statistics about a sealed archive stream.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    /// Bytes of object content fed into the archive
    pub original_size: u64,

    /// Bytes of the compressed stream
    pub compressed_size: u64,

    /// Compression ratio (compressed / original)
    pub compression_ratio: f64,
}

impl CompressionStats {
    /// Creates new compression statistics.
    pub fn new(original_size: u64, compressed_size: u64) -> Self {
        let compression_ratio = if original_size > 0 {
            compressed_size as f64 / original_size as f64
        } else {
            0.0
        };

        Self {
            original_size,
            compressed_size,
            compression_ratio,
        }
    }

    /// Returns compression percentage saved.
    pub fn compression_percentage(&self) -> u8 {
        ((1.0 - self.compression_ratio).clamp(0.0, 1.0) * 100.0) as u8
    }
}

/// Streaming encoder for one of the supported formats.
pub enum ArchiveEncoder<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Plain(W),
}

impl<W: Write> ArchiveEncoder<W> {
    /// Wrap `writer` in the encoder for `format`.
    pub fn new(format: CompressionFormat, level: u32, writer: W) -> io::Result<Self> {
        Ok(match format {
            CompressionFormat::TarGz => Self::Gzip(GzEncoder::new(writer, Compression::new(level))),
            CompressionFormat::TarZst => Self::Zstd(zstd::Encoder::new(writer, level as i32)?),
            CompressionFormat::Tar | CompressionFormat::Zip => Self::Plain(writer),
        })
    }

    /// Flush the trailer and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(encoder) => encoder.finish(),
            Self::Zstd(encoder) => encoder.finish(),
            Self::Plain(mut writer) => {
                writer.flush()?;
                Ok(writer)
            }
        }
    }
}

impl<W: Write> Write for ArchiveEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Plain(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
            Self::Plain(writer) => writer.flush(),
        }
    }
}

/// Wrap `reader` in the decoder for `format`.
pub fn decoder<R>(format: CompressionFormat, reader: R) -> io::Result<Box<dyn Read + Send>>
where
    R: Read + Send + 'static,
{
    Ok(match format {
        CompressionFormat::TarGz => Box::new(GzDecoder::new(reader)),
        CompressionFormat::TarZst => Box::new(zstd::Decoder::with_buffer(BufReader::new(reader))?),
        CompressionFormat::Tar | CompressionFormat::Zip => Box::new(reader),
    })
}

/// Calculates SHA256 checksum of a file.
pub fn calculate_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex_digest(hasher))
}

/// Calculates SHA256 checksum and length of a file.
pub fn checksum_and_size(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hex_digest(hasher), size))
}

/// Lower-case hex of a finished hasher.
pub fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Writer that calculates SHA256 checksum while writing.
pub struct ChecksumWriter<W: Write> {
    writer: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn checksum(&self) -> String {
        hex_digest(self.hasher.clone())
    }

    /// Flush and return the inner writer with the final checksum and length.
    pub fn finish(mut self) -> io::Result<(W, String, u64)> {
        self.writer.flush()?;
        Ok((self.writer, hex_digest(self.hasher), self.bytes_written))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Reader that calculates SHA256 checksum of everything read through it.
pub struct ChecksumReader<R: Read> {
    reader: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Final checksum and length.
    pub fn finish(self) -> (String, u64) {
        (hex_digest(self.hasher), self.bytes_read)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn roundtrip(format: CompressionFormat, level: u32) {
        let content = b"Repeated content that compresses very well! ".repeat(2000);

        let mut encoder = ArchiveEncoder::new(format, level, Vec::new()).unwrap();
        encoder.write_all(&content).unwrap();
        let compressed = encoder.finish().unwrap();

        if format != CompressionFormat::Tar {
            assert!(compressed.len() < content.len() / 2);
        }

        let mut decoded = Vec::new();
        decoder(format, Cursor::new(compressed))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_gzip_stream() {
        roundtrip(CompressionFormat::TarGz, 6);
    }

    #[test]
    fn test_zstd_stream() {
        roundtrip(CompressionFormat::TarZst, 3);
    }

    #[test]
    fn test_plain_stream_is_passthrough() {
        let mut encoder = ArchiveEncoder::new(CompressionFormat::Tar, 0, Vec::new()).unwrap();
        encoder.write_all(b"raw").unwrap();
        assert_eq!(encoder.finish().unwrap(), b"raw");
    }

    #[test]
    fn test_calculate_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.txt");
        std::fs::write(&path, b"Test content for checksum").unwrap();

        let checksum = calculate_checksum(&path).unwrap();
        assert_eq!(checksum.len(), 64);

        let (again, size) = checksum_and_size(&path).unwrap();
        assert_eq!(checksum, again);
        assert_eq!(size, 25);
    }

    #[test]
    fn test_checksum_writer_and_reader_agree() {
        let mut writer = ChecksumWriter::new(Vec::new());
        writer.write_all(b"Hello, ").unwrap();
        writer.write_all(b"World!").unwrap();
        let (content, written_sum, written) = writer.finish().unwrap();
        assert_eq!(written, 13);
        assert_eq!(content, b"Hello, World!");

        let mut reader = ChecksumReader::new(Cursor::new(content));
        io::copy(&mut reader, &mut io::sink()).unwrap();
        let (read_sum, read) = reader.finish();
        assert_eq!(read, 13);
        assert_eq!(read_sum, written_sum);
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats::new(1000, 500);
        assert_eq!(stats.compression_ratio, 0.5);
        assert_eq!(stats.compression_percentage(), 50);

        let stats = CompressionStats::new(0, 10);
        assert_eq!(stats.compression_ratio, 0.0);
    }
}
