//! Byte-exact splitting of an archive stream into numbered parts
//!
//! [`PartWriter`] owns the active part. Every part except the last is
//! exactly `threshold` bytes long; a new part file is only opened when more
//! bytes arrive, so a stream whose length is a multiple of the threshold
//! never ends with an empty part. [`PartsReader`] reads parts back as one
//! continuous stream.

use crate::compression::hex_digest;
use crate::manifest::ArchivePart;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Highest part number the three-digit suffix can express
pub const MAX_PARTS: u32 = 999;

/// Archive file name for a single-part stream, e.g. `archive.tar.gz`
pub fn archive_file_name(extension: &str) -> String {
    format!("archive.{}", extension)
}

/// Name of part `sequence` (1-based) of a split stream
pub fn part_file_name(extension: &str, sequence: u32) -> String {
    format!("archive.{}.{:03}", extension, sequence)
}

/// Whether `name` looks like an archive file or part
pub fn is_archive_file(name: &str) -> bool {
    name.starts_with("archive.")
}

/// Result of a finished split
#[derive(Debug, Clone)]
pub struct SplitOutput {
    /// Parts in sequence order
    pub parts: Vec<ArchivePart>,

    /// Length of the whole stream
    pub total_bytes: u64,

    /// Hex SHA-256 of the whole stream
    pub sha256: String,
}

struct ActivePart {
    file: BufWriter<File>,
    hasher: Sha256,
    written: u64,
}

/// Writer that spreads a stream over size-bounded part files
pub struct PartWriter {
    dir: PathBuf,
    extension: String,
    unit_id: String,
    threshold: u64,
    active: Option<ActivePart>,
    parts: Vec<ArchivePart>,
    stream_hasher: Sha256,
    total_bytes: u64,
}

impl PartWriter {
    /// Write parts into `dir`, each at most `threshold` bytes
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        unit_id: impl Into<String>,
        threshold: u64,
    ) -> io::Result<Self> {
        if threshold == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "split threshold must be positive",
            ));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extension: extension.into(),
            unit_id: unit_id.into(),
            threshold,
            active: None,
            parts: Vec::new(),
            stream_hasher: Sha256::new(),
            total_bytes: 0,
        })
    }

    fn open_next(&mut self) -> io::Result<()> {
        let sequence = self.parts.len() as u32 + 1;
        if sequence > MAX_PARTS {
            return Err(io::Error::other(format!(
                "archive needs more than {} parts; raise the split threshold",
                MAX_PARTS
            )));
        }
        let path = self.dir.join(part_file_name(&self.extension, sequence));
        let file = File::create(&path)?;
        self.active = Some(ActivePart {
            file: BufWriter::new(file),
            hasher: Sha256::new(),
            written: 0,
        });
        Ok(())
    }

    fn seal_active(&mut self) -> io::Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let file = active.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let sequence = self.parts.len() as u32 + 1;
        self.parts.push(ArchivePart {
            sequence,
            name: part_file_name(&self.extension, sequence),
            size: active.written,
            sha256: hex_digest(active.hasher),
            unit_id: self.unit_id.clone(),
        });
        Ok(())
    }

    /// Seal the last part and name the output.
    ///
    /// A stream that fits in one part is renamed to the unsuffixed archive
    /// name.
    pub fn finish(mut self) -> io::Result<SplitOutput> {
        if self.active.is_none() && self.parts.is_empty() {
            self.open_next()?;
        }
        self.seal_active()?;

        if self.parts.len() == 1 {
            let single = archive_file_name(&self.extension);
            fs::rename(self.dir.join(&self.parts[0].name), self.dir.join(&single))?;
            self.parts[0].name = single;
        }

        Ok(SplitOutput {
            parts: self.parts,
            total_bytes: self.total_bytes,
            sha256: hex_digest(self.stream_hasher),
        })
    }
}

impl Write for PartWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            if self.active.is_none() {
                self.open_next()?;
            }
            let threshold = self.threshold;
            let Some(active) = self.active.as_mut() else {
                return Err(io::Error::other("no active archive part"));
            };

            let room = (threshold - active.written) as usize;
            let n = room.min(remaining.len());
            active.file.write_all(&remaining[..n])?;
            active.hasher.update(&remaining[..n]);
            active.written += n as u64;
            let full = active.written == threshold;

            self.stream_hasher.update(&remaining[..n]);
            self.total_bytes += n as u64;
            remaining = &remaining[n..];

            if full {
                self.seal_active()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.active {
            Some(ref mut active) => active.file.flush(),
            None => Ok(()),
        }
    }
}

/// Reads a sequence of part files as one stream
pub struct PartsReader {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<File>,
}

impl PartsReader {
    /// Read the files in the given order
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            pending: paths.into_iter(),
            current: None,
        }
    }

    /// Read the named parts of `dir` in sequence order
    pub fn for_parts(dir: &Path, parts: &[ArchivePart]) -> Self {
        let mut ordered: Vec<&ArchivePart> = parts.iter().collect();
        ordered.sort_by_key(|p| p.sequence);
        Self::new(ordered.iter().map(|p| dir.join(&p.name)).collect())
    }
}

impl Read for PartsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.pending.next() {
                    Some(path) => self.current = Some(File::open(path)?),
                    None => return Ok(0),
                }
            }
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
            }
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::calculate_checksum;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    fn split(data: &[u8], threshold: u64, chunk: usize) -> (SplitOutput, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut writer = PartWriter::new(temp.path(), "tar.gz", "unit", threshold).unwrap();
        for piece in data.chunks(chunk) {
            writer.write_all(piece).unwrap();
        }
        (writer.finish().unwrap(), temp)
    }

    fn reassemble(dir: &Path, output: &SplitOutput) -> Vec<u8> {
        let mut data = Vec::new();
        PartsReader::for_parts(dir, &output.parts)
            .read_to_end(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn test_part_count_is_ceiling_and_bytes_roundtrip() {
        let data = random_bytes(10_000);
        for threshold in [1_000u64, 3_000, 4_096, 9_999, 10_000] {
            let (output, temp) = split(&data, threshold, 777);
            let expected = (data.len() as u64).div_ceil(threshold) as usize;
            assert_eq!(output.parts.len(), expected, "threshold {}", threshold);
            assert_eq!(output.total_bytes, data.len() as u64);

            let (last, full) = output.parts.split_last().unwrap();
            for part in full {
                assert_eq!(part.size, threshold);
            }
            assert!(last.size > 0 && last.size <= threshold);

            assert_eq!(reassemble(temp.path(), &output), data);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_trailing_part() {
        let data = random_bytes(4_000);
        let (output, temp) = split(&data, 1_000, 1_000);
        assert_eq!(output.parts.len(), 4);
        assert!(output.parts.iter().all(|p| p.size == 1_000));
        assert!(!temp.path().join("archive.tar.gz.005").exists());
    }

    #[test]
    fn test_naming_and_checksums() {
        let data = random_bytes(2_500);
        let (output, temp) = split(&data, 1_000, 64);
        let names: Vec<_> = output.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["archive.tar.gz.001", "archive.tar.gz.002", "archive.tar.gz.003"]
        );
        for part in &output.parts {
            let on_disk = calculate_checksum(&temp.path().join(&part.name)).unwrap();
            assert_eq!(on_disk, part.sha256);
            assert_eq!(part.unit_id, "unit");
        }

        let mut hasher = Sha256::new();
        hasher.update(&data);
        assert_eq!(output.sha256, hex_digest(hasher));
    }

    #[test]
    fn test_single_part_uses_plain_name() {
        let data = random_bytes(500);
        let (output, temp) = split(&data, 1_000, 100);
        assert_eq!(output.parts.len(), 1);
        assert_eq!(output.parts[0].name, "archive.tar.gz");
        assert!(temp.path().join("archive.tar.gz").exists());
        assert!(!temp.path().join("archive.tar.gz.001").exists());
    }

    #[test]
    fn test_too_many_parts_fails() {
        let temp = TempDir::new().unwrap();
        let mut writer = PartWriter::new(temp.path(), "tar", "unit", 1).unwrap();
        let data = vec![0u8; MAX_PARTS as usize];
        writer.write_all(&data).unwrap();
        assert!(writer.write_all(&[1]).is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let temp = TempDir::new().unwrap();
        assert!(PartWriter::new(temp.path(), "tar", "unit", 0).is_err());
    }
}
