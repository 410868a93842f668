//! Persisted reveal progress.
//!
//! The snapshot holds the session counters plus one record per revealed gift;
//! unrevealed gifts are implied by their absence. Writes go to a sibling temp
//! file that is renamed over the target, so a reader never sees a partial
//! snapshot. Only one process is expected to write a given file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::model::{Gift, GiftId, GiftState, SelectionMode, Session};

#[derive(Debug, Error)]
pub enum ProgressLoadError {
    #[error("failed to read progress snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt progress snapshot {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to serialize progress: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write progress snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove progress snapshot {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub enum LoadStatus {
    NoSnapshot,
    Restored { revealed: usize, ignored: usize },
    /// The snapshot could not be used; session and gifts were left at defaults.
    Reset(ProgressLoadError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevealRecord {
    pub id: GiftId,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub revealed_at: DateTime<Utc>,
    pub revealed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub total_revealed: u32,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_played: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: SelectionMode,
    #[serde(default, alias = "current_agent_index")]
    pub rotation_index: u32,
    #[serde(default)]
    pub revealed_gifts: Vec<RevealRecord>,
}

impl ProgressSnapshot {
    pub fn capture(session: &Session, gifts: &[Gift], now: DateTime<Utc>) -> Self {
        let revealed_gifts = gifts
            .iter()
            .filter_map(|gift| match &gift.state {
                GiftState::Revealed {
                    revealed_at,
                    revealed_by,
                } => Some(RevealRecord {
                    id: gift.id,
                    revealed_at: *revealed_at,
                    revealed_by: revealed_by.clone(),
                }),
                GiftState::Unrevealed => None,
            })
            .collect();

        Self {
            total_revealed: session.total_revealed,
            last_played: Some(now),
            mode: session.mode,
            rotation_index: session.rotation_index,
            revealed_gifts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies the persisted snapshot to `session` and `gifts`. Never fails:
    /// a missing snapshot is the initial state, an unreadable one is logged
    /// and replaced by defaults.
    pub fn load(&self, session: &mut Session, gifts: &mut [Gift]) -> LoadStatus {
        let snapshot = match self.read_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                *session = Session::default();
                return LoadStatus::NoSnapshot;
            }
            Err(err) => {
                tracing::error!("error loading progress, starting fresh: {err}");
                *session = Session::default();
                for gift in gifts.iter_mut() {
                    gift.state = GiftState::Unrevealed;
                }
                return LoadStatus::Reset(err);
            }
        };

        let mut revealed = 0;
        let mut ignored = 0;
        for record in snapshot.revealed_gifts {
            match gifts.iter_mut().find(|g| g.id == record.id) {
                Some(gift) if !gift.is_revealed() => {
                    gift.state = GiftState::Revealed {
                        revealed_at: record.revealed_at,
                        revealed_by: record.revealed_by,
                    };
                    revealed += 1;
                }
                Some(_) => ignored += 1,
                None => {
                    tracing::warn!(gift_id = record.id, "snapshot references unknown gift, ignoring");
                    ignored += 1;
                }
            }
        }

        let actual = revealed as u32;
        if snapshot.total_revealed != actual {
            tracing::warn!(
                stored = snapshot.total_revealed,
                actual,
                "snapshot total_revealed disagrees with revealed gifts, using actual count"
            );
        }

        *session = Session {
            total_revealed: actual,
            last_played: snapshot.last_played,
            mode: snapshot.mode,
            rotation_index: snapshot.rotation_index,
        };

        tracing::info!(
            revealed = actual,
            total = gifts.len(),
            rotation_index = session.rotation_index,
            "progress loaded"
        );
        LoadStatus::Restored { revealed, ignored }
    }

    /// Writes the snapshot and returns it. `session.last_played` is not touched;
    /// callers update it once the write has succeeded.
    pub fn save(
        &self,
        session: &Session,
        gifts: &[Gift],
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, PersistenceError> {
        let snapshot = ProgressSnapshot::capture(session, gifts, now);
        let json = serde_json::to_vec_pretty(&snapshot)?;
        self.write_atomic(&json).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(
            revealed = snapshot.revealed_gifts.len(),
            rotation_index = snapshot.rotation_index,
            "progress saved"
        );
        Ok(snapshot)
    }

    /// Deletes the snapshot. A snapshot that does not exist counts as cleared.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn read_snapshot(&self) -> Result<Option<ProgressSnapshot>, ProgressLoadError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ProgressLoadError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ProgressLoadError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    fn write_atomic(&self, contents: &[u8]) -> io::Result<()> {
        let tmp_path = self.temp_path()?;
        if let Some(parent) = tmp_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let result = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn temp_path(&self) -> io::Result<PathBuf> {
        let file_name = self.path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "progress path has no file name")
        })?;
        let tmp_name = format!(".{}.tmp", file_name.to_string_lossy());
        Ok(self.path.with_file_name(tmp_name))
    }
}

/// Accepts RFC 3339 timestamps as well as naive ISO-8601 strings written by
/// earlier versions, which are taken to be local time.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn gifts(ids: &[GiftId]) -> Vec<Gift> {
        ids.iter()
            .map(|id| Gift::new(*id, format!("gift {id}"), vec![], format!("{id}.png")))
            .collect()
    }

    fn reveal(gift: &mut Gift, by: &str, at: DateTime<Utc>) {
        gift.state = GiftState::Revealed {
            revealed_at: at,
            revealed_by: by.to_string(),
        };
    }

    #[test]
    fn missing_snapshot_is_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let mut session = Session {
            total_revealed: 9,
            ..Session::default()
        };
        let mut all = gifts(&[1, 2]);

        let status = store.load(&mut session, &mut all);
        assert!(matches!(status, LoadStatus::NoSnapshot));
        assert_eq!(session, Session::default());
        assert!(all.iter().all(|g| !g.is_revealed()));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("nested").join("progress.json"));
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();

        let mut saved_gifts = gifts(&[1, 2, 3]);
        reveal(&mut saved_gifts[0], "Stitch", at);
        reveal(&mut saved_gifts[2], "Olaf", at);
        let session = Session {
            total_revealed: 2,
            last_played: None,
            mode: SelectionMode::Sequential,
            rotation_index: 1,
        };
        store.save(&session, &saved_gifts, Utc::now()).unwrap();

        let mut loaded_session = Session::default();
        let mut loaded_gifts = gifts(&[1, 2, 3]);
        let status = store.load(&mut loaded_session, &mut loaded_gifts);

        assert!(matches!(
            status,
            LoadStatus::Restored {
                revealed: 2,
                ignored: 0
            }
        ));
        assert_eq!(loaded_session.total_revealed, 2);
        assert_eq!(loaded_session.mode, SelectionMode::Sequential);
        assert_eq!(loaded_session.rotation_index, 1);
        assert!(loaded_session.last_played.is_some());
        assert_eq!(loaded_gifts, saved_gifts);
        assert!(!dir.path().join("nested").join(".progress.json.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_resets_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "{ \"total_revealed\": ").unwrap();
        let store = ProgressStore::new(&path);

        let mut session = Session {
            mode: SelectionMode::Sequential,
            rotation_index: 3,
            ..Session::default()
        };
        let mut all = gifts(&[1]);
        reveal(&mut all[0], "Stitch", Utc::now());

        let status = store.load(&mut session, &mut all);
        assert!(matches!(status, LoadStatus::Reset(ProgressLoadError::Corrupt { .. })));
        assert_eq!(session, Session::default());
        assert!(!all[0].is_revealed());
    }

    #[test]
    fn unknown_ids_are_ignored_and_total_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(
            &path,
            json!({
                "total_revealed": 5,
                "last_played": "2025-01-01T10:00:00Z",
                "mode": "random",
                "rotation_index": 0,
                "revealed_gifts": [
                    { "id": 2, "revealed_at": "2025-01-01T09:00:00Z", "revealed_by": "Moana" },
                    { "id": 99, "revealed_at": "2025-01-01T09:30:00Z", "revealed_by": "Olaf" }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let mut session = Session::default();
        let mut all = gifts(&[1, 2]);
        let status = ProgressStore::new(&path).load(&mut session, &mut all);

        assert!(matches!(
            status,
            LoadStatus::Restored {
                revealed: 1,
                ignored: 1
            }
        ));
        assert_eq!(session.total_revealed, 1);
        assert_eq!(all[1].revealed_by(), Some("Moana"));
        assert!(!all[0].is_revealed());
    }

    #[test]
    fn accepts_legacy_field_names_and_naive_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(
            &path,
            json!({
                "total_revealed": 1,
                "last_played": "2024-05-01T12:00:00.123456",
                "mode": "sequential",
                "current_agent_index": 1,
                "revealed_gifts": [
                    { "id": 1, "revealed_at": "2024-05-01T11:59:58.000001", "revealed_by": "Baymax" }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let mut session = Session::default();
        let mut all = gifts(&[1]);
        ProgressStore::new(&path).load(&mut session, &mut all);

        assert_eq!(session.rotation_index, 1);
        assert_eq!(session.mode, SelectionMode::Sequential);
        assert!(session.last_played.is_some());
        assert_eq!(all[0].revealed_by(), Some("Baymax"));
    }

    #[test]
    fn save_reports_unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = ProgressStore::new(blocker.join("progress.json"));

        let err = store
            .save(&Session::default(), &gifts(&[1]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
    }

    #[test]
    fn clear_tolerates_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        store.clear().unwrap();

        store.save(&Session::default(), &[], Utc::now()).unwrap();
        assert!(store.path().exists());
        store.clear().unwrap();
        assert!(!store.path().exists());
    }
}
