//! Client order id allocation
//!
//! Ids take the form `<prefix>-<process_uid>-<counter>`. The process uid
//! is minted once at start from the wall clock plus random bits, so ids
//! from different runs cannot collide even if the counter file is lost;
//! the counter additionally persists across restarts. In-flight
//! collisions are the OMS's to detect and fail with `IdCollision`.

use anyhow::{Context, Result};
use common::ClientOrderId;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const COUNTER_FILE: &str = "order_ids";

/// Allocator for globally-unique, idempotent client order ids
pub struct IdAllocator {
    prefix: String,
    process_uid: String,
    counter: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl IdAllocator {
    /// Create an allocator; `state_dir` enables counter persistence
    ///
    /// The prefix plus uid plus a 20-digit counter must fit in 36 chars,
    /// so prefixes are clamped short.
    pub fn new(prefix: &str, state_dir: Option<&Path>) -> Result<Self> {
        let prefix: String = prefix.chars().take(4).collect();
        let process_uid = Self::mint_process_uid();

        let persist_path = state_dir.map(|d| d.join(COUNTER_FILE));
        let start = match &persist_path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                raw.trim().parse::<u64>().unwrap_or_else(|_| {
                    warn!(path = %path.display(), "unreadable id counter; starting fresh");
                    0
                })
            }
            _ => 0,
        };

        debug!(prefix = %prefix, uid = %process_uid, start, "id allocator ready");
        Ok(Self {
            prefix,
            process_uid,
            counter: AtomicU64::new(start),
            persist_path,
        })
    }

    /// Allocate the next id
    pub fn next(&self) -> ClientOrderId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let raw = format!("{}-{}-{}", self.prefix, self.process_uid, n);
        ClientOrderId::new(raw).expect("allocator output is always valid")
    }

    /// Last allocated counter value
    #[must_use]
    pub fn last_counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Persist the counter for the next run
    pub fn persist(&self) -> Result<()> {
        if let Some(path) = &self.persist_path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, self.last_counter().to_string())
                .with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }

    /// Timestamp (base36 millis) plus random suffix, 12 chars max
    fn mint_process_uid() -> String {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let rand_part: u32 = rand::thread_rng().gen_range(0..36_u32.pow(3));
        format!("{}{}", to_base36(millis), to_base36(u64::from(rand_part)))
    }
}

fn to_base36(mut v: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_valid() {
        let alloc = IdAllocator::new("q", None).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = alloc.next();
            assert!(id.as_str().len() <= ClientOrderId::MAX_LEN);
            assert!(seen.insert(id.as_str().to_string()), "duplicate id");
        }
    }

    #[test]
    fn parallel_allocation_never_collides() {
        use std::sync::Arc;
        let alloc = Arc::new(IdAllocator::new("q", None).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| alloc.next().as_str().to_string()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id across threads");
            }
        }
        assert_eq!(seen.len(), 16_000);
    }

    #[test]
    fn counter_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();

        let first_ids: Vec<String> = {
            let alloc = IdAllocator::new("q", Some(dir.path())).unwrap();
            let ids = (0..100).map(|_| alloc.next().as_str().to_string()).collect();
            alloc.persist().unwrap();
            ids
        };

        // Restart: counter resumes and the uid differs, so no collisions.
        let alloc = IdAllocator::new("q", Some(dir.path())).unwrap();
        assert_eq!(alloc.last_counter(), 100);
        let mut seen: HashSet<String> = first_ids.into_iter().collect();
        for _ in 0..100 {
            assert!(seen.insert(alloc.next().as_str().to_string()));
        }
    }

    #[test]
    fn long_prefix_is_clamped() {
        let alloc = IdAllocator::new("excessively-long-prefix", None).unwrap();
        let id = alloc.next();
        assert!(id.as_str().starts_with("exce-"));
        assert!(id.as_str().len() <= ClientOrderId::MAX_LEN);
    }
}
