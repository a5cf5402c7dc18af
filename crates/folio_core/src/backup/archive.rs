//! Backup archive codec.
//!
//! An archive is one zstd stream. Inside it, all integers are big-endian:
//!
//! ```text
//! | magic "FOLIOARC" | version u32 | prefix len u16 | prefix |
//! entry:   | 0x01 | path len u16 | path |
//! chunk:   | 0x02 | len u32 | bytes |            (zero or more per entry)
//! end:     | 0x03 | crc32 u32 | total len u64 |
//! trailer: | 0x00 | entry count u32 |
//! ```
//!
//! Entry paths are stored with the archive's path prefix already applied.

use crate::error::{CoreError, CoreResult};
use std::io::{BufReader, Read, Write};

const ARCHIVE_MAGIC: [u8; 8] = *b"FOLIOARC";
pub(crate) const ARCHIVE_VERSION: u32 = 1;

/// Largest chunk written in one frame.
const MAX_CHUNK: usize = 1 << 20;

const TAG_TRAILER: u8 = 0x00;
const TAG_ENTRY: u8 = 0x01;
const TAG_CHUNK: u8 = 0x02;
const TAG_ENTRY_END: u8 = 0x03;

/// zstd compression level used for archives.
const COMPRESSION_LEVEL: i32 = 6;

struct OpenEntry {
    hasher: crc32fast::Hasher,
    len: u64,
}

/// Streams entries into a compressed archive.
///
/// # Example
///
/// ```rust
/// use folio_core::{ArchiveReader, ArchiveWriter};
///
/// let mut writer = ArchiveWriter::new(Vec::new(), "db-backup/").unwrap();
/// writer.add_entry("notes.txt", b"hello").unwrap();
/// let bytes = writer.finish().unwrap();
///
/// let mut reader = ArchiveReader::new(bytes.as_slice()).unwrap();
/// let entry = reader.next_entry().unwrap().unwrap();
/// assert_eq!(entry.path, "db-backup/notes.txt");
/// assert_eq!(entry.data, b"hello");
/// ```
pub struct ArchiveWriter<W: Write> {
    encoder: zstd::Encoder<'static, W>,
    prefix: String,
    entries: u32,
    open: Option<OpenEntry>,
}

impl<W: Write> ArchiveWriter<W> {
    /// Starts an archive whose entry paths all begin with `prefix`.
    pub fn new(writer: W, prefix: &str) -> CoreResult<Self> {
        if prefix.len() > u16::MAX as usize {
            return Err(CoreError::limit_exceeded("archive path prefix too long"));
        }
        let mut encoder = zstd::Encoder::new(writer, COMPRESSION_LEVEL)?;
        encoder.write_all(&ARCHIVE_MAGIC)?;
        encoder.write_all(&ARCHIVE_VERSION.to_be_bytes())?;
        encoder.write_all(&(prefix.len() as u16).to_be_bytes())?;
        encoder.write_all(prefix.as_bytes())?;

        Ok(Self {
            encoder,
            prefix: prefix.to_string(),
            entries: 0,
            open: None,
        })
    }

    /// Begins an entry named `name` (the prefix is prepended).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if another entry is still open.
    pub fn start_entry(&mut self, name: &str) -> CoreResult<()> {
        if self.open.is_some() {
            return Err(CoreError::invalid_state("archive entry already open"));
        }
        let path = format!("{}{name}", self.prefix);
        if path.len() > u16::MAX as usize {
            return Err(CoreError::limit_exceeded("archive entry path too long"));
        }
        self.encoder.write_all(&[TAG_ENTRY])?;
        self.encoder.write_all(&(path.len() as u16).to_be_bytes())?;
        self.encoder.write_all(path.as_bytes())?;
        self.open = Some(OpenEntry {
            hasher: crc32fast::Hasher::new(),
            len: 0,
        });
        Ok(())
    }

    /// Appends bytes to the open entry.
    pub fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        let entry = self
            .open
            .as_mut()
            .ok_or_else(|| CoreError::invalid_state("no archive entry open"))?;
        for chunk in data.chunks(MAX_CHUNK) {
            self.encoder.write_all(&[TAG_CHUNK])?;
            self.encoder.write_all(&(chunk.len() as u32).to_be_bytes())?;
            self.encoder.write_all(chunk)?;
            entry.hasher.update(chunk);
            entry.len += chunk.len() as u64;
        }
        Ok(())
    }

    /// Closes the open entry, recording its checksum and length.
    pub fn finish_entry(&mut self) -> CoreResult<()> {
        let entry = self
            .open
            .take()
            .ok_or_else(|| CoreError::invalid_state("no archive entry open"))?;
        self.encoder.write_all(&[TAG_ENTRY_END])?;
        self.encoder.write_all(&entry.hasher.finalize().to_be_bytes())?;
        self.encoder.write_all(&entry.len.to_be_bytes())?;
        self.entries += 1;
        Ok(())
    }

    /// Writes a complete entry in one call.
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> CoreResult<()> {
        self.start_entry(name)?;
        self.write(data)?;
        self.finish_entry()
    }

    /// Number of finished entries.
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entries
    }

    /// Writes the trailer, ends the zstd stream and returns the writer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if an entry is still open.
    pub fn finish(mut self) -> CoreResult<W> {
        if self.open.is_some() {
            return Err(CoreError::invalid_state("archive entry still open"));
        }
        self.encoder.write_all(&[TAG_TRAILER])?;
        self.encoder.write_all(&self.entries.to_be_bytes())?;
        Ok(self.encoder.finish()?)
    }
}

/// One decoded archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Full path, prefix included.
    pub path: String,
    /// Entry contents.
    pub data: Vec<u8>,
}

/// Reads entries back out of an archive.
pub struct ArchiveReader<R: Read> {
    decoder: zstd::Decoder<'static, BufReader<R>>,
    prefix: String,
    seen: u32,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    /// Opens an archive and checks its header.
    ///
    /// # Errors
    ///
    /// Returns `Format` if the magic or version doesn't match.
    pub fn new(reader: R) -> CoreResult<Self> {
        let mut decoder = zstd::Decoder::new(reader)?;

        let mut magic = [0u8; 8];
        decoder.read_exact(&mut magic)?;
        if magic != ARCHIVE_MAGIC {
            return Err(CoreError::format("not a folio backup archive"));
        }
        let version = read_u32(&mut decoder)?;
        if version != ARCHIVE_VERSION {
            return Err(CoreError::format(format!(
                "unsupported archive version {version}"
            )));
        }
        let prefix = read_string(&mut decoder)?;

        Ok(Self {
            decoder,
            prefix,
            seen: 0,
            done: false,
        })
    }

    /// The path prefix every entry starts with.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reads the next entry, or `None` after the trailer.
    ///
    /// # Errors
    ///
    /// Returns `Format` on an unknown frame, a checksum or length mismatch,
    /// or a trailer whose entry count disagrees with what was read.
    pub fn next_entry(&mut self) -> CoreResult<Option<ArchiveEntry>> {
        if self.done {
            return Ok(None);
        }

        match read_u8(&mut self.decoder)? {
            TAG_TRAILER => {
                let count = read_u32(&mut self.decoder)?;
                if count != self.seen {
                    return Err(CoreError::format(format!(
                        "archive trailer counts {count} entries, read {}",
                        self.seen
                    )));
                }
                self.done = true;
                Ok(None)
            }
            TAG_ENTRY => {
                let path = read_string(&mut self.decoder)?;
                let data = self.read_body(&path)?;
                self.seen += 1;
                Ok(Some(ArchiveEntry { path, data }))
            }
            tag => Err(CoreError::format(format!("unexpected archive frame {tag:#04x}"))),
        }
    }

    /// Reads every remaining entry.
    pub fn entries(mut self) -> CoreResult<Vec<ArchiveEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next_entry()? {
            out.push(entry);
        }
        Ok(out)
    }

    fn read_body(&mut self, path: &str) -> CoreResult<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            match read_u8(&mut self.decoder)? {
                TAG_CHUNK => {
                    let len = read_u32(&mut self.decoder)? as usize;
                    if len > MAX_CHUNK {
                        return Err(CoreError::format(format!(
                            "{path}: chunk of {len} bytes exceeds {MAX_CHUNK}"
                        )));
                    }
                    let start = data.len();
                    data.resize(start + len, 0);
                    self.decoder.read_exact(&mut data[start..])?;
                }
                TAG_ENTRY_END => {
                    let crc = read_u32(&mut self.decoder)?;
                    let len = read_u64(&mut self.decoder)?;
                    if len != data.len() as u64 || crc != crc32fast::hash(&data) {
                        return Err(CoreError::format(format!(
                            "{path}: checksum or length mismatch"
                        )));
                    }
                    return Ok(data);
                }
                tag => {
                    return Err(CoreError::format(format!(
                        "{path}: unexpected frame {tag:#04x}"
                    )))
                }
            }
        }
    }
}

fn read_u8(r: &mut impl Read) -> CoreResult<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> CoreResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> CoreResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_string(r: &mut impl Read) -> CoreResult<String> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| CoreError::format("archive path is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new(), "bk/").unwrap();
        writer.add_entry("a.txt", b"alpha").unwrap();
        writer.start_entry("big.bin").unwrap();
        writer.write(&[1u8; 100]).unwrap();
        writer.write(&[2u8; 50]).unwrap();
        writer.finish_entry().unwrap();
        writer.add_entry("empty", b"").unwrap();
        assert_eq!(writer.entry_count(), 3);
        writer.finish().unwrap()
    }

    #[test]
    fn entries_come_back_in_order() {
        let bytes = sample();
        let reader = ArchiveReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.prefix(), "bk/");

        let entries = reader.entries().unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["bk/a.txt", "bk/big.bin", "bk/empty"]);
        assert_eq!(entries[1].data.len(), 150);
        assert_eq!(entries[1].data[100], 2);
        assert!(entries[2].data.is_empty());
    }

    #[test]
    fn archive_is_compressed() {
        let mut writer = ArchiveWriter::new(Vec::new(), "").unwrap();
        writer.add_entry("zeros", &vec![0u8; 64 * 1024]).unwrap();
        let bytes = writer.finish().unwrap();
        assert!(bytes.len() < 4 * 1024);
    }

    #[test]
    fn nested_entries_rejected() {
        let mut writer = ArchiveWriter::new(Vec::new(), "").unwrap();
        writer.start_entry("one").unwrap();
        assert!(writer.start_entry("two").is_err());
    }

    #[test]
    fn finish_with_open_entry_rejected() {
        let mut writer = ArchiveWriter::new(Vec::new(), "").unwrap();
        writer.start_entry("one").unwrap();
        assert!(matches!(
            writer.finish(),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let bytes = zstd::encode_all(&b"definitely not an archive"[..], 1).unwrap();
        assert!(matches!(
            ArchiveReader::new(bytes.as_slice()),
            Err(CoreError::Format { .. })
        ));
    }

    #[test]
    fn truncated_archive_fails() {
        let bytes = sample();
        let cut = &bytes[..bytes.len() / 2];
        let result = ArchiveReader::new(cut).and_then(ArchiveReader::entries);
        assert!(result.is_err());
    }
}
