//! WAL segment files
//!
//! A segment is a plain concatenation of records:
//!
//! ```text
//! record := u32 length | u64 seq | u8 kind | payload | u32 crc32
//! ```
//!
//! `length` counts everything after the length field itself; the CRC
//! covers every preceding byte of the record including the length prefix.
//! Files are named `wal-<seq_start>.log` so recovery can order segments
//! without opening them.

use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// seq (8) + kind (1) + crc (4)
pub const RECORD_OVERHEAD: u32 = 13;

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Monotone sequence, unique within and across segments
    pub seq: u64,
    /// Caller-defined record kind tag
    pub kind: u8,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Encode one record into `buf`
pub fn encode_record(buf: &mut Vec<u8>, seq: u64, kind: u8, payload: &[u8]) {
    let length = RECORD_OVERHEAD + payload.len() as u32;
    let start = buf.len();
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Why a segment scan stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// End of file on a record boundary
    CleanEof,
    /// Truncated record header or body (torn write)
    Torn {
        /// Byte offset of the last good boundary
        good_end: u64,
    },
    /// CRC mismatch
    Corrupt {
        /// Byte offset of the last good boundary
        good_end: u64,
    },
}

/// Append-side handle for one segment file
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    /// First sequence stored in the file, taken from the name
    seq_start: u64,
}

impl Segment {
    /// File name for a segment starting at `seq_start`
    #[must_use]
    pub fn file_name(seq_start: u64) -> String {
        format!("wal-{seq_start}.log")
    }

    /// Parse a `wal-<seq_start>.log` file name
    #[must_use]
    pub fn parse_file_name(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }

    /// Create a fresh segment in `dir`
    pub fn create(dir: &Path, seq_start: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(seq_start));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        trace!(path = %path.display(), "created wal segment");
        Ok(Self {
            path,
            file: BufWriter::with_capacity(64 * 1024, file),
            size: 0,
            seq_start,
        })
    }

    /// Open an existing segment for appending after `valid_len` bytes
    ///
    /// Anything past `valid_len` (a torn tail from a crash) is cut off.
    pub fn open_for_append(path: &Path, valid_len: u64) -> Result<Self> {
        let seq_start = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::parse_file_name)
            .ok_or_else(|| anyhow!("not a wal segment: {}", path.display()))?;
        let file = OpenOptions::new().write(true).read(true).open(path)?;
        file.set_len(valid_len)?;
        let mut file = file;
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::with_capacity(64 * 1024, file),
            size: valid_len,
            seq_start,
        })
    }

    /// Append pre-encoded record bytes
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes to the OS
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    /// Current file size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First sequence in this segment
    #[must_use]
    pub const fn seq_start(&self) -> u64 {
        self.seq_start
    }

    /// Path on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-side scanner over one segment file
pub struct SegmentReader {
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    /// Open a segment for scanning from the start
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::with_capacity(64 * 1024, file),
            offset: 0,
        })
    }

    /// Read the next record, validating framing and CRC
    ///
    /// `Ok(Ok(record))` on success, `Ok(Err(stop))` when the scan must
    /// stop (EOF, torn tail, corruption), `Err` only on I/O failure.
    pub fn read_next(&mut self) -> Result<std::result::Result<Record, ScanStop>> {
        let good_end = self.offset;

        let length = match self.reader.read_u32::<LittleEndian>() {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Ok(Err(ScanStop::CleanEof));
            }
            Err(e) => return Err(e.into()),
        };
        if length < RECORD_OVERHEAD {
            return Ok(Err(ScanStop::Corrupt { good_end }));
        }

        let mut body = vec![0_u8; length as usize];
        if let Err(e) = self.reader.read_exact(&mut body) {
            if e.kind() == ErrorKind::UnexpectedEof {
                return Ok(Err(ScanStop::Torn { good_end }));
            }
            return Err(e.into());
        }

        let (head, crc_bytes) = body.split_at(length as usize - 4);
        let expected_crc = u32::from_le_bytes([
            crc_bytes[0],
            crc_bytes[1],
            crc_bytes[2],
            crc_bytes[3],
        ]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(head);
        if hasher.finalize() != expected_crc {
            return Ok(Err(ScanStop::Corrupt { good_end }));
        }

        let seq = u64::from_le_bytes(head[0..8].try_into().expect("8-byte seq"));
        let kind = head[8];
        let payload = head[9..].to_vec();

        self.offset += 4 + u64::from(length);
        Ok(Ok(Record { seq, kind, payload }))
    }

    /// Byte offset of the next unread record
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}
