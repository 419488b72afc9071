// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{channel::NolEntry, timer::Time},
    anyhow::{Context, Error},
    log::debug,
    serde::{Deserialize, Serialize},
    std::{
        convert::TryFrom,
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

/// Keeps the non-occupancy list across restarts. Monotonic time does not survive a reboot, so
/// implementations translate expiries through the wall clock.
pub trait NolStore: Send + Sync {
    /// Live entries, with expiries expressed on the monotonic clock whose current value is
    /// `now`.
    fn load(&self, now: Time) -> Result<Vec<NolEntry>, Error>;
    fn save(&self, entries: &[NolEntry], now: Time) -> Result<(), Error>;
}

/// On-disk form of a `NolEntry`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct PersistentNolEntry {
    channel: u8,
    expiry_unix_ms: u64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct PersistentNol {
    entries: Vec<PersistentNolEntry>,
}

type WallClock = Box<dyn Fn() -> SystemTime + Send + Sync>;

/// Stores the NOL as a JSON document at a fixed path.
pub struct JsonFileNolStore {
    path: PathBuf,
    wall_clock: WallClock,
}

impl JsonFileNolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_wall_clock(path, Box::new(SystemTime::now))
    }

    pub fn with_wall_clock(path: impl Into<PathBuf>, wall_clock: WallClock) -> Self {
        JsonFileNolStore { path: path.into(), wall_clock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unix_ms(&self) -> Result<u64, Error> {
        let since_epoch = (self.wall_clock)()
            .duration_since(UNIX_EPOCH)
            .context("wall clock is before the unix epoch")?;
        Ok(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
    }
}

impl NolStore for JsonFileNolStore {
    fn load(&self, now: Time) -> Result<Vec<NolEntry>, Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No persisted NOL at {}", self.path.display());
                return Ok(vec![]);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let persisted: PersistentNol = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        let wall_now = self.unix_ms()?;
        let entries: Vec<NolEntry> = persisted
            .entries
            .into_iter()
            .filter_map(|entry| {
                let remaining = entry.expiry_unix_ms.checked_sub(wall_now).filter(|ms| *ms > 0)?;
                let expiry = now + Duration::from_millis(remaining);
                Some(NolEntry { channel: entry.channel, expiry })
            })
            .collect();
        debug!("Loaded {} live NOL entries from {}", entries.len(), self.path.display());
        Ok(entries)
    }

    fn save(&self, entries: &[NolEntry], now: Time) -> Result<(), Error> {
        let wall_now = self.unix_ms()?;
        let persisted = PersistentNol {
            entries: entries
                .iter()
                .filter(|entry| entry.expiry > now)
                .map(|entry| {
                    let remaining = u64::try_from(now.until(entry.expiry).as_millis())
                        .unwrap_or(u64::MAX);
                    PersistentNolEntry {
                        channel: entry.channel,
                        expiry_unix_ms: wall_now.saturating_add(remaining),
                    }
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&persisted).context("serializing NOL")?;
        // Write then rename so a crash never leaves a truncated file behind.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, json).with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        tempfile::TempDir,
    };

    const BOOT_WALL_SECS: u64 = 1_600_000_000;

    /// A wall clock the test can move forward.
    fn fake_wall_clock() -> (Arc<AtomicU64>, WallClock) {
        let secs = Arc::new(AtomicU64::new(BOOT_WALL_SECS));
        let clock = Arc::clone(&secs);
        (secs, Box::new(move || UNIX_EPOCH + Duration::from_secs(clock.load(Ordering::SeqCst))))
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonFileNolStore::new(dir.path().join("nol.json"));
        assert!(store.load(Time::ZERO).expect("load").is_empty());
    }

    #[test]
    fn entries_survive_reboot() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nol.json");
        let (wall, clock) = fake_wall_clock();
        let store = JsonFileNolStore::with_wall_clock(&path, clock);

        // Before the reboot the monotonic clock read 500s.
        let before = Time::from_secs(500);
        let entries = vec![
            NolEntry { channel: 52, expiry: before + Duration::from_secs(1800) },
            NolEntry { channel: 100, expiry: before + Duration::from_secs(60) },
        ];
        store.save(&entries, before).expect("save");

        // Ten minutes pass on the wall clock; the monotonic clock restarts at 0.
        wall.fetch_add(600, Ordering::SeqCst);
        let loaded = store.load(Time::ZERO).expect("load");
        assert_eq!(loaded, vec![NolEntry { channel: 52, expiry: Time::from_secs(1200) }]);
    }

    #[test]
    fn expired_entries_are_not_written() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nol.json");
        let (_wall, clock) = fake_wall_clock();
        let store = JsonFileNolStore::with_wall_clock(&path, clock);
        let now = Time::from_secs(100);
        store.save(&[NolEntry { channel: 120, expiry: Time::from_secs(50) }], now).expect("save");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(json, serde_json::json!({ "entries": [] }));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_format() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nol.json");
        let (_wall, clock) = fake_wall_clock();
        let store = JsonFileNolStore::with_wall_clock(&path, clock);
        let entry = NolEntry { channel: 64, expiry: Time::from_secs(30) };
        store.save(&[entry], Time::ZERO).expect("save");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "entries": [{ "channel": 64, "expiry_unix_ms": (BOOT_WALL_SECS + 30) * 1000 }]
            })
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nol.json");
        fs::write(&path, "{ not json").expect("write");
        let store = JsonFileNolStore::new(&path);
        let e = store.load(Time::ZERO).expect_err("corrupt file");
        assert!(format!("{:#}", e).contains("parsing"));
    }
}
