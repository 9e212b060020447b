//! Write-ahead log over segment files
//!
//! Appends are batched in memory and flushed when the batch reaches a
//! byte threshold or an age threshold, then fsync'd according to the
//! configured sync mode. Recovery scans segments in seq order, verifies
//! CRCs, stops at the first invalid record and truncates the tail so the
//! log can be appended to again.

use crate::segment::{Record, ScanStop, Segment, SegmentReader, encode_record};
use anyhow::{Context, Result, anyhow};
use common::config::{WalConfig, WalSyncMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Batch flush threshold in bytes
const BATCH_BYTES: usize = 64 * 1024;

/// The write-ahead log
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    current: Option<Segment>,
    batch: Vec<u8>,
    batch_started: Instant,
    next_seq: u64,
    /// Seq of the last record known durable (fsync mode only)
    durable_seq: u64,
}

impl Wal {
    /// Open (or create) a WAL in `config.dir`, recovering existing state
    ///
    /// Returns the log positioned after the last valid record plus every
    /// record recovered from disk, in order.
    pub fn open(config: &WalConfig) -> Result<(Self, Recovery)> {
        let dir = PathBuf::from(&config.dir);
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating wal dir {}", dir.display()))?;
        }

        let recovery = Self::scan(&dir)?;

        // Truncate the damaged tail, if any, so appends restart cleanly.
        // Segments past the damaged one are unreachable and removed.
        let mut recovery = recovery;
        if let Some((path, good_end)) = recovery.truncate_at.clone() {
            warn!(
                path = %path.display(),
                offset = good_end,
                "truncating wal segment at last good record"
            );
            let file = fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(good_end)?;

            let mut past_damage = false;
            for seg in Self::list_segments(&dir)? {
                if past_damage {
                    warn!(path = %seg.display(), "removing wal segment past damage");
                    fs::remove_file(&seg)?;
                }
                if seg == path {
                    past_damage = true;
                }
            }
            recovery.last_segment = Some(path);
        }
        let recovery = recovery;

        let next_seq = recovery.records.last().map_or(1, |r| r.seq + 1);
        let current = match recovery.last_segment.as_ref() {
            Some(path) => {
                let len = fs::metadata(path)?.len();
                Some(Segment::open_for_append(path, len)?)
            }
            None => None,
        };

        info!(
            dir = %dir.display(),
            records = recovery.records.len(),
            next_seq,
            "wal opened"
        );

        Ok((
            Self {
                dir,
                config: config.clone(),
                current,
                batch: Vec::with_capacity(BATCH_BYTES),
                batch_started: Instant::now(),
                next_seq,
                durable_seq: next_seq.saturating_sub(1),
            },
            recovery,
        ))
    }

    /// Append one record; returns its sequence number
    ///
    /// The record is buffered; durability follows the flush policy. Call
    /// [`Wal::flush`] to force it out.
    pub fn append(&mut self, kind: u8, payload: &[u8]) -> Result<u64> {
        let seq = self.next_seq;
        if self.batch.is_empty() {
            self.batch_started = Instant::now();
        }
        encode_record(&mut self.batch, seq, kind, payload);
        self.next_seq += 1;

        if self.batch.len() >= BATCH_BYTES || self.batch_age_expired() {
            self.flush()?;
        }
        Ok(seq)
    }

    /// Serialize an entry with bincode and append it
    pub fn append_entry<T: Serialize>(&mut self, kind: u8, entry: &T) -> Result<u64> {
        let payload = bincode::serialize(entry).context("wal entry encode")?;
        self.append(kind, &payload)
    }

    /// True when the buffered batch is older than the flush interval
    #[must_use]
    pub fn batch_age_expired(&self) -> bool {
        !self.batch.is_empty()
            && self.batch_started.elapsed().as_millis() as u64 >= self.config.flush_interval_ms
    }

    /// Flush the batch to the current segment and apply the sync mode
    pub fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        self.roll_if_needed()?;
        let segment = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("wal flush without segment"))?;

        segment.append_bytes(&self.batch)?;
        match self.config.sync_mode {
            WalSyncMode::Fsync => {
                segment.sync()?;
                self.durable_seq = self.next_seq - 1;
            }
            WalSyncMode::Async => segment.flush()?,
        }
        self.batch.clear();
        Ok(())
    }

    /// Sequence of the last record confirmed on stable storage
    ///
    /// In `async` mode this lags arbitrarily; callers own the loss window.
    #[must_use]
    pub const fn durable_seq(&self) -> u64 {
        self.durable_seq
    }

    /// Next sequence that will be assigned
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Write a checkpoint record and delete superseded segments
    ///
    /// The checkpoint payload (a compacted state snapshot) becomes the
    /// first record of a fresh segment; all older segments are removed.
    pub fn checkpoint(&mut self, kind: u8, payload: &[u8]) -> Result<u64> {
        self.flush()?;

        let seq = self.next_seq;
        let mut segment = Segment::create(&self.dir, seq)?;
        let mut buf = Vec::new();
        encode_record(&mut buf, seq, kind, payload);
        segment.append_bytes(&buf)?;
        segment.sync()?;
        self.next_seq += 1;
        self.durable_seq = seq;

        let keep = segment.path().to_path_buf();
        self.current = Some(segment);

        let mut removed = 0_u64;
        for path in Self::list_segments(&self.dir)? {
            if path != keep {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!(removed, seq, "wal checkpoint complete");
        Ok(seq)
    }

    fn roll_if_needed(&mut self) -> Result<()> {
        let needs_roll = match &self.current {
            None => true,
            Some(seg) => seg.size() + self.batch.len() as u64 >= self.config.max_segment_bytes,
        };
        if needs_roll {
            if let Some(mut old) = self.current.take() {
                old.sync()?;
            }
            self.current = Some(Segment::create(&self.dir, self.next_seq)?);
        }
        Ok(())
    }

    /// Scan every segment in `dir` in seq order
    fn scan(dir: &Path) -> Result<Recovery> {
        let mut records = Vec::new();
        let mut truncate_at = None;
        let segments = Self::list_segments(dir)?;
        let last_segment = segments.last().cloned();

        'segments: for path in &segments {
            let mut reader = SegmentReader::open(path)?;
            loop {
                match reader.read_next()? {
                    Ok(record) => {
                        // Cross-segment monotonicity: a regression means a
                        // stale file; stop rather than replay garbage.
                        if let Some(last) = records.last() {
                            let last: &Record = last;
                            if record.seq <= last.seq {
                                warn!(
                                    path = %path.display(),
                                    seq = record.seq,
                                    "non-monotone wal sequence; stopping recovery"
                                );
                                truncate_at = Some((path.clone(), reader.offset()));
                                break 'segments;
                            }
                        }
                        records.push(record);
                    }
                    Err(ScanStop::CleanEof) => break,
                    Err(ScanStop::Torn { good_end }) | Err(ScanStop::Corrupt { good_end }) => {
                        truncate_at = Some((path.clone(), good_end));
                        break 'segments;
                    }
                }
            }
        }

        Ok(Recovery {
            records,
            truncate_at,
            last_segment,
        })
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                let seq = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(Segment::parse_file_name)?;
                Some((seq, path))
            })
            .collect();
        segments.sort_by_key(|(seq, _)| *seq);
        Ok(segments.into_iter().map(|(_, p)| p).collect())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "wal flush failed on drop");
        }
    }
}

/// Result of the recovery scan
pub struct Recovery {
    /// All valid records, in sequence order
    pub records: Vec<Record>,
    /// Segment path and byte offset where damage was found, if any
    pub truncate_at: Option<(PathBuf, u64)>,
    /// Last segment on disk (append target)
    pub last_segment: Option<PathBuf>,
}

impl Recovery {
    /// Decode every record of `kind` with bincode
    pub fn decode<T: DeserializeOwned>(&self, kind: u8) -> Result<Vec<(u64, T)>> {
        self.records
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| {
                let value = bincode::deserialize(&r.payload).context("wal entry decode")?;
                Ok((r.seq, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> WalConfig {
        WalConfig {
            enabled: true,
            dir: dir.to_string_lossy().into_owned(),
            sync_mode: WalSyncMode::Fsync,
            max_segment_bytes: 1024 * 1024,
            flush_interval_ms: 1_000,
        }
    }

    #[test]
    fn append_flush_recover_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let (mut wal, recovery) = Wal::open(&config).unwrap();
            assert!(recovery.records.is_empty());
            for i in 0..100_u32 {
                wal.append(1, &i.to_le_bytes()).unwrap();
            }
            wal.flush().unwrap();
            assert_eq!(wal.durable_seq(), 100);
        }

        let (_wal, recovery) = Wal::open(&config).unwrap();
        assert_eq!(recovery.records.len(), 100);
        for (i, record) in recovery.records.iter().enumerate() {
            assert_eq!(record.seq, i as u64 + 1);
            assert_eq!(record.payload, (i as u32).to_le_bytes());
        }
    }

    #[test]
    fn recovery_stops_at_bit_flip_and_reopens() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        {
            let (mut wal, _) = Wal::open(&config).unwrap();
            for i in 0..1_000_u32 {
                wal.append(1, &i.to_le_bytes()).unwrap();
            }
            wal.flush().unwrap();
        }

        // Flip a bit roughly two-thirds in.
        let seg = Wal::list_segments(tmp.path()).unwrap()[0].clone();
        let mut bytes = fs::read(&seg).unwrap();
        let target = bytes.len() * 2 / 3;
        bytes[target] ^= 0x10;
        fs::write(&seg, &bytes).unwrap();

        let (mut wal, recovery) = Wal::open(&config).unwrap();
        assert!(recovery.truncate_at.is_some());
        let recovered = recovery.records.len();
        assert!(recovered < 1_000 && recovered > 0);

        // The tail was truncated; appends continue from the good seq.
        let seq = wal.append(1, b"after").unwrap();
        assert_eq!(seq, recovered as u64 + 1);
        wal.flush().unwrap();

        let (_w, recovery2) = Wal::open(&config).unwrap();
        assert_eq!(recovery2.records.len(), recovered + 1);
        assert!(recovery2.truncate_at.is_none());
    }

    #[test]
    fn segment_rollover_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.max_segment_bytes = 512;

        {
            let (mut wal, _) = Wal::open(&config).unwrap();
            for i in 0..200_u32 {
                wal.append(2, &i.to_le_bytes()).unwrap();
                wal.flush().unwrap();
            }
        }

        assert!(Wal::list_segments(tmp.path()).unwrap().len() > 1);
        let (_w, recovery) = Wal::open(&config).unwrap();
        assert_eq!(recovery.records.len(), 200);
        let seqs: Vec<u64> = recovery.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn checkpoint_drops_old_segments() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.max_segment_bytes = 256;

        let (mut wal, _) = Wal::open(&config).unwrap();
        for i in 0..100_u32 {
            wal.append(1, &i.to_le_bytes()).unwrap();
            wal.flush().unwrap();
        }
        assert!(Wal::list_segments(tmp.path()).unwrap().len() > 1);

        let ckpt_seq = wal.checkpoint(9, b"snapshot").unwrap();
        assert_eq!(Wal::list_segments(tmp.path()).unwrap().len(), 1);

        // Post-checkpoint appends land after the checkpoint record.
        wal.append(1, b"next").unwrap();
        wal.flush().unwrap();
        drop(wal);

        let (_w, recovery) = Wal::open(&config).unwrap();
        assert_eq!(recovery.records.len(), 2);
        assert_eq!(recovery.records[0].seq, ckpt_seq);
        assert_eq!(recovery.records[0].kind, 9);
        assert_eq!(recovery.records[1].payload, b"next");
    }

    #[test]
    fn typed_entries_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Entry {
            id: String,
            qty: i64,
        }

        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        {
            let (mut wal, _) = Wal::open(&config).unwrap();
            wal.append_entry(
                3,
                &Entry {
                    id: "c1".into(),
                    qty: 100,
                },
            )
            .unwrap();
            wal.flush().unwrap();
        }
        let (_w, recovery) = Wal::open(&config).unwrap();
        let decoded: Vec<(u64, Entry)> = recovery.decode(3).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0].1,
            Entry {
                id: "c1".into(),
                qty: 100
            }
        );
    }
}
