//! MCQ (multi-codebook quantized) bitstream container

use std::io::{Read, Write};
use std::path::Path;

use mcquic_core::{CodeSize, Error, ImageSize, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::{MCQ_MAGIC, MCQ_VERSION};

/// Per-level entry of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelHeader {
    /// Code map height
    pub height: u32,
    /// Code map width
    pub width: u32,
    /// Codebook size
    pub k: u32,
    /// Low 32 bits of xxh3 over the little-endian indices
    pub checksum: u32,
    /// Entropy-coded payload length in bytes
    pub payload_len: u32,
}

impl LevelHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 20;
}

/// MCQ file header.
///
/// # Binary Layout
///
/// ```text
/// Offset  Size   Field
/// ──────  ────   ─────
/// 0       4      magic ("MCQ\0")
/// 4       2      version (u16)
/// 6       8      model fingerprint (u64)
/// 14      4      image height (u32)
/// 18      4      image width (u32)
/// 22      1      latent channels
/// 23      1      groups per latent (m)
/// 24      1      coded levels (n)
/// 25      20·n   level headers, coarsest coded level last
/// ──────────────────────────────────
/// followed by the n payloads in the same order
/// ```
///
/// All integers are little-endian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McqHeader {
    /// Format version
    pub version: u16,
    /// Fingerprint of the model that wrote the stream
    pub fingerprint: u64,
    /// Original image height
    pub height: u32,
    /// Original image width
    pub width: u32,
    /// Latent channels
    pub channel: u8,
    /// Groups per latent
    pub m: u8,
    /// Coded levels, finest first
    pub levels: Vec<LevelHeader>,
}

impl McqHeader {
    /// Size of the fixed part in bytes
    pub const FIXED_SIZE: usize = 25;

    /// Total encoded size in bytes
    pub fn size(&self) -> usize {
        Self::FIXED_SIZE + self.levels.len() * LevelHeader::SIZE
    }

    /// Original image size
    pub fn image_size(&self) -> ImageSize {
        ImageSize::rgb(self.height as usize, self.width as usize)
    }

    /// Code map shapes of the coded levels
    pub fn code_size(&self) -> Result<CodeSize> {
        CodeSize::new(
            self.m as usize,
            self.levels.iter().map(|l| l.height as usize).collect(),
            self.levels.iter().map(|l| l.width as usize).collect(),
            self.levels.iter().map(|l| l.k as usize).collect(),
        )
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&MCQ_MAGIC);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.fingerprint.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.width.to_le_bytes());
        bytes.push(self.channel);
        bytes.push(self.m);
        bytes.push(self.levels.len() as u8);
        for level in &self.levels {
            bytes.extend_from_slice(&level.height.to_le_bytes());
            bytes.extend_from_slice(&level.width.to_le_bytes());
            bytes.extend_from_slice(&level.k.to_le_bytes());
            bytes.extend_from_slice(&level.checksum.to_le_bytes());
            bytes.extend_from_slice(&level.payload_len.to_le_bytes());
        }
        bytes
    }

    /// Deserialize from the start of `bytes`.
    ///
    /// The version is checked before any other field is trusted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(bytes, None)
    }

    /// Like [`McqHeader::from_bytes`], rejecting streams from a model other
    /// than `fingerprint` before the level table is read.
    pub fn from_bytes_verified(bytes: &[u8], fingerprint: u64) -> Result<Self> {
        Self::parse(bytes, Some(fingerprint))
    }

    fn parse(bytes: &[u8], expected: Option<u64>) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.take(4)?;
        if magic != MCQ_MAGIC {
            return Err(Error::corrupted_at("invalid magic bytes", 0));
        }
        let version = cursor.u16()?;
        if version != MCQ_VERSION {
            return Err(Error::UnsupportedVersion {
                found: version,
                supported: MCQ_VERSION,
            });
        }

        let fingerprint = cursor.u64()?;
        if let Some(expected) = expected {
            if fingerprint != expected {
                return Err(Error::FingerprintMismatch {
                    expected,
                    found: fingerprint,
                });
            }
        }
        let height = cursor.u32()?;
        let width = cursor.u32()?;
        let channel = cursor.u8()?;
        let m = cursor.u8()?;
        let count = cursor.u8()? as usize;
        if count == 0 {
            return Err(Error::corrupted_at("stream has no coded levels", cursor.pos - 1));
        }

        let mut levels = Vec::with_capacity(count);
        for _ in 0..count {
            levels.push(LevelHeader {
                height: cursor.u32()?,
                width: cursor.u32()?,
                k: cursor.u32()?,
                checksum: cursor.u32()?,
                payload_len: cursor.u32()?,
            });
        }

        Ok(Self {
            version,
            fingerprint,
            height,
            width,
            channel,
            m,
            levels,
        })
    }
}

/// Checksum stored per level: low 32 bits of xxh3 over LE indices.
pub fn index_checksum(indices: &[u16]) -> u32 {
    let bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
    xxh3_64(&bytes) as u32
}

/// A complete MCQ bitstream
#[derive(Debug, Clone, PartialEq)]
pub struct McqFile {
    /// Header
    pub header: McqHeader,
    /// Entropy-coded payloads, one per coded level
    pub payloads: Vec<Vec<u8>>,
}

impl McqFile {
    /// Assemble a file, filling in the payload lengths
    pub fn new(mut header: McqHeader, payloads: Vec<Vec<u8>>) -> Result<Self> {
        if header.levels.len() != payloads.len() {
            return Err(Error::shape(header.levels.len(), payloads.len()));
        }
        for (level, payload) in header.levels.iter_mut().zip(&payloads) {
            level.payload_len = u32::try_from(payload.len())
                .map_err(|_| Error::config("level payload exceeds 4 GiB"))?;
        }
        Ok(Self { header, payloads })
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payloads.iter().map(Vec::len).sum::<usize>()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header.to_bytes();
        bytes.reserve(self.size() - bytes.len());
        for payload in &self.payloads {
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::with_payloads(McqHeader::from_bytes(bytes)?, bytes)
    }

    /// Deserialize a stream that must come from the model with
    /// `fingerprint`.
    ///
    /// Checks magic, version and fingerprint before any payload length, so
    /// a damaged stream from another model still reports the mismatch.
    pub fn from_bytes_verified(bytes: &[u8], fingerprint: u64) -> Result<Self> {
        Self::with_payloads(McqHeader::from_bytes_verified(bytes, fingerprint)?, bytes)
    }

    fn with_payloads(header: McqHeader, bytes: &[u8]) -> Result<Self> {
        let mut offset = header.size();
        let expected: usize = header.levels.iter().map(|l| l.payload_len as usize).sum();
        let available = bytes.len() - offset;
        if available < expected {
            return Err(Error::unexpected_eof(bytes.len()));
        }
        if available > expected {
            return Err(Error::shape(
                format!("{} payload bytes", expected),
                format!("{} payload bytes", available),
            ));
        }

        let mut payloads = Vec::with_capacity(header.levels.len());
        for level in &header.levels {
            let len = level.payload_len as usize;
            payloads.push(bytes[offset..offset + len].to_vec());
            offset += len;
        }
        Ok(Self { header, payloads })
    }

    /// Check the stream was written by a model with `fingerprint`.
    pub fn verify_fingerprint(&self, fingerprint: u64) -> Result<()> {
        if self.header.fingerprint != fingerprint {
            return Err(Error::FingerprintMismatch {
                expected: fingerprint,
                found: self.header.fingerprint,
            });
        }
        Ok(())
    }

    /// Write to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.header.to_bytes())?;
        for payload in &self.payloads {
            writer.write_all(payload)?;
        }
        Ok(())
    }

    /// Read from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Read a stream that must come from the model with `fingerprint`.
    pub fn read_verified<R: Read>(reader: &mut R, fingerprint: u64) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes_verified(&bytes, fingerprint)
    }

    /// Save to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read_from(&mut file)
    }

    /// Load a file that must come from the model with `fingerprint`.
    pub fn load_verified(path: &Path, fingerprint: u64) -> Result<Self> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read_verified(&mut file, fingerprint)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| Error::unexpected_eof(self.bytes.len()))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> McqFile {
        let header = McqHeader {
            version: MCQ_VERSION,
            fingerprint: 0xDEAD_BEEF_0123_4567,
            height: 30,
            width: 40,
            channel: 12,
            m: 4,
            levels: vec![
                LevelHeader {
                    height: 8,
                    width: 10,
                    k: 512,
                    checksum: index_checksum(&[1, 2, 3]),
                    payload_len: 0,
                },
                LevelHeader {
                    height: 4,
                    width: 5,
                    k: 128,
                    checksum: 7,
                    payload_len: 0,
                },
            ],
        };
        McqFile::new(header, vec![vec![1, 2, 3, 4, 5], vec![9, 9]]).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let file = sample();
        let bytes = file.header.to_bytes();
        assert_eq!(bytes.len(), McqHeader::FIXED_SIZE + 2 * LevelHeader::SIZE);
        assert_eq!(&bytes[0..4], b"MCQ\0");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), MCQ_VERSION);
        assert_eq!(bytes[24], 2);
    }

    #[test]
    fn test_file_roundtrip() {
        let file = sample();
        let bytes = file.to_bytes();
        assert_eq!(bytes.len(), file.size());
        let back = McqFile::from_bytes(&bytes).unwrap();
        assert_eq!(back, file);
        assert_eq!(back.header.levels[0].payload_len, 5);
        assert_eq!(back.header.code_size().unwrap().total_symbols(), 4 * 80 + 4 * 20);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            McqFile::from_bytes(&bytes),
            Err(Error::CorruptedData { .. })
        ));

        let mut bytes = sample().to_bytes();
        bytes[4] = 9;
        let err = McqFile::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { found: 9, .. }));
        assert!(err.is_incompatible_stream());
    }

    #[test]
    fn test_length_checks() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            McqFile::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::UnexpectedEof { .. })
        ));
        assert!(matches!(
            McqFile::from_bytes(&bytes[..10]),
            Err(Error::UnexpectedEof { .. })
        ));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            McqFile::from_bytes(&longer),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_fingerprint_check() {
        let file = sample();
        assert!(file.verify_fingerprint(0xDEAD_BEEF_0123_4567).is_ok());
        let err = file.verify_fingerprint(1).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { expected: 1, .. }));
    }

    #[test]
    fn test_fingerprint_checked_before_lengths() {
        let bytes = sample().to_bytes();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            McqFile::from_bytes_verified(truncated, 1),
            Err(Error::FingerprintMismatch { expected: 1, .. })
        ));
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0; 3]);
        assert!(matches!(
            McqFile::from_bytes_verified(&padded, 1),
            Err(Error::FingerprintMismatch { .. })
        ));
        // Cut inside the level table
        assert!(matches!(
            McqFile::from_bytes_verified(&bytes[..30], 1),
            Err(Error::FingerprintMismatch { .. })
        ));
        // Right model, damaged stream
        assert!(matches!(
            McqFile::from_bytes_verified(truncated, 0xDEAD_BEEF_0123_4567),
            Err(Error::UnexpectedEof { .. })
        ));
        // Version still comes first
        let mut old = bytes.clone();
        old[4] = 9;
        assert!(matches!(
            McqFile::from_bytes_verified(&old, 1),
            Err(Error::UnsupportedVersion { .. })
        ));
        assert_eq!(
            McqFile::from_bytes_verified(&bytes, 0xDEAD_BEEF_0123_4567).unwrap(),
            sample()
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.mcq");
        let file = sample();
        file.save(&path).unwrap();
        assert_eq!(McqFile::load(&path).unwrap(), file);
        assert_eq!(McqFile::load_verified(&path, 0xDEAD_BEEF_0123_4567).unwrap(), file);
        assert!(McqFile::load_verified(&path, 2).is_err());
    }
}
