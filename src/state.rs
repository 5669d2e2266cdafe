//! Persisted shared state.
//!
//! A single JSON document records the active session and each session's
//! last-observed working directory, environment, and connection flag, so
//! that a new process (or a concurrent reader such as the prompt renderer)
//! observes a consistent view:
//!
//! ```json
//! {"active_session":"local",
//!  "sessions":{"local":{"type":"local","connected":true,"cwd":"/home/me","env":{}}},
//!  "updated_at":"2024-01-15T10:30:00Z"}
//! ```
//!
//! # Atomicity
//!
//! Every save serializes the in-memory document into a temporary file in
//! the target directory, fsyncs it, and renames it over the target.
//! Readers on the same filesystem therefore never observe a torn write.
//! A process-wide mutex serializes in-memory mutation; cross-process
//! safety rests on rename atomicity.
//!
//! The file is created 0600 and its parent directories 0700 — the
//! document carries environment values that may be sensitive.
//!
//! # Forward compatibility
//!
//! Unknown fields are ignored on load and missing fields take their zero
//! defaults. There is no schema version.

use std::collections::BTreeMap;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted attributes of one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    /// `"local"` or `"ssh"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The whole on-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub active_session: String,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionState>,
    #[serde(default)]
    pub updated_at: String,
}

/// Partial update applied to one session's persisted state.
///
/// `None` fields are left untouched, so callers patch only what they
/// observed.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub connected: Option<bool>,
    pub cwd: Option<String>,
    pub kind: Option<String>,
}

/// Handle to the persisted state document.
///
/// The manager writes through this store; external callers read. All
/// mutating operations save immediately.
pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

/// Location of the state file: `$XDG_DATA_HOME/thop/state.json`, with
/// `~/.local/share/thop/state.json` as the usual default.
pub fn default_state_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("thop").join("state.json");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".local/share/thop/state.json")
}

impl StateStore {
    /// Open the store at an explicit path, loading the existing document
    /// if there is one.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let doc = Self::load_from(&path)?;
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Open the store at the default location.
    pub fn open_default() -> io::Result<Self> {
        Self::open(default_state_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from(path: &Path) -> io::Result<StateDocument> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no state file at {}, starting empty", path.display());
                Ok(StateDocument::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-read the document from disk, replacing the in-memory copy.
    pub fn load(&self) -> io::Result<()> {
        let fresh = Self::load_from(&self.path)?;
        *self.doc.lock().expect("state lock poisoned") = fresh;
        Ok(())
    }

    /// Serialize the current document and atomically replace the file.
    pub fn save(&self) -> io::Result<()> {
        let doc = self.doc.lock().expect("state lock poisoned");
        self.write_locked(&doc)
    }

    fn write_locked(&self, doc: &StateDocument) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "state path has no parent"))?;
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;

        let mut out = doc.clone();
        out.updated_at = chrono::Utc::now().to_rfc3339();

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), &out)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Name of the active session, if any was ever persisted.
    pub fn get_active(&self) -> Option<String> {
        let doc = self.doc.lock().expect("state lock poisoned");
        if doc.active_session.is_empty() {
            None
        } else {
            Some(doc.active_session.clone())
        }
    }

    /// Record the active session and save.
    pub fn set_active(&self, name: &str) -> io::Result<()> {
        let mut doc = self.doc.lock().expect("state lock poisoned");
        doc.active_session = name.to_string();
        self.write_locked(&doc)
    }

    /// Apply a partial update to one session's entry and save.
    ///
    /// The entry is created if it does not exist yet.
    pub fn update_session_state(&self, name: &str, patch: StatePatch) -> io::Result<()> {
        let mut doc = self.doc.lock().expect("state lock poisoned");
        let entry = doc.sessions.entry(name.to_string()).or_default();
        if let Some(kind) = patch.kind {
            entry.kind = kind;
        }
        if let Some(connected) = patch.connected {
            entry.connected = connected;
        }
        if let Some(cwd) = patch.cwd {
            entry.cwd = cwd;
        }
        self.write_locked(&doc)
    }

    /// Snapshot of one session's persisted state.
    pub fn get_session_state(&self, name: &str) -> Option<SessionState> {
        let doc = self.doc.lock().expect("state lock poisoned");
        doc.sessions.get(name).cloned()
    }

    /// The persisted environment for one session.
    pub fn get_session_env(&self, name: &str) -> BTreeMap<String, String> {
        let doc = self.doc.lock().expect("state lock poisoned");
        doc.sessions
            .get(name)
            .map(|s| s.env.clone())
            .unwrap_or_default()
    }

    /// Record one environment variable for a session and save.
    pub fn set_session_env(&self, name: &str, key: &str, value: &str) -> io::Result<()> {
        let mut doc = self.doc.lock().expect("state lock poisoned");
        let entry = doc.sessions.entry(name.to_string()).or_default();
        entry.env.insert(key.to_string(), value.to_string());
        self.write_locked(&doc)
    }

    /// Drop a session's entry entirely and save.
    pub fn remove_session(&self, name: &str) -> io::Result<()> {
        let mut doc = self.doc.lock().expect("state lock poisoned");
        doc.sessions.remove(name);
        self.write_locked(&doc)
    }

    /// Snapshot of the whole document (for listings and tests).
    pub fn snapshot(&self) -> StateDocument {
        self.doc.lock().expect("state lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::open(dir.path().join("state.json")).unwrap()
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_open_missing_file_starts_empty() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            assert_eq!(store.get_active(), None);
            assert!(store.snapshot().sessions.is_empty());
        }

        #[test]
        fn test_set_active_persists_immediately() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store.set_active("build-box").unwrap();

            let reopened = store_in(&dir);
            assert_eq!(reopened.get_active().as_deref(), Some("build-box"));
        }

        #[test]
        fn test_update_creates_entry() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store
                .update_session_state(
                    "local",
                    StatePatch {
                        connected: Some(true),
                        cwd: Some("/tmp".into()),
                        kind: Some("local".into()),
                    },
                )
                .unwrap();

            let state = store.get_session_state("local").unwrap();
            assert!(state.connected);
            assert_eq!(state.cwd, "/tmp");
            assert_eq!(state.kind, "local");
        }

        #[test]
        fn test_patch_leaves_untouched_fields() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store
                .update_session_state(
                    "web",
                    StatePatch {
                        connected: Some(true),
                        cwd: Some("/srv".into()),
                        kind: Some("ssh".into()),
                    },
                )
                .unwrap();
            store
                .update_session_state(
                    "web",
                    StatePatch {
                        connected: Some(false),
                        ..Default::default()
                    },
                )
                .unwrap();

            let state = store.get_session_state("web").unwrap();
            assert!(!state.connected);
            assert_eq!(state.cwd, "/srv");
            assert_eq!(state.kind, "ssh");
        }

        #[test]
        fn test_env_round_trips() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store.set_session_env("web", "RUST_LOG", "debug").unwrap();
            store.set_session_env("web", "EDITOR", "vim").unwrap();

            let reopened = store_in(&dir);
            let env = reopened.get_session_env("web");
            assert_eq!(env.get("RUST_LOG").map(String::as_str), Some("debug"));
            assert_eq!(env.get("EDITOR").map(String::as_str), Some("vim"));
        }

        #[test]
        fn test_remove_session() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store.set_session_env("gone", "A", "1").unwrap();
            store.remove_session("gone").unwrap();
            assert_eq!(store.get_session_state("gone"), None);
        }
    }

    mod atomicity_and_modes {
        use super::*;

        #[test]
        fn test_file_mode_is_0600() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store.save().unwrap();

            let mode = std::fs::metadata(store.path())
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }

        #[test]
        fn test_parent_dir_mode_is_0700() {
            let dir = tempfile::tempdir().unwrap();
            let store = StateStore::open(dir.path().join("nested/state.json")).unwrap();
            store.save().unwrap();

            let mode = std::fs::metadata(dir.path().join("nested"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o700);
        }

        #[test]
        fn test_no_leftover_temp_files() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            for i in 0..5 {
                store.set_session_env("local", "N", &i.to_string()).unwrap();
            }

            let entries: Vec<_> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
        }
    }

    mod round_trip {
        use super::*;

        #[test]
        fn test_document_round_trips_byte_equivalent_modulo_updated_at() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(&dir);
            store.set_active("web").unwrap();
            store.set_session_env("web", "B", "2").unwrap();
            store.set_session_env("web", "A", "1").unwrap();
            store
                .update_session_state(
                    "web",
                    StatePatch {
                        connected: Some(true),
                        cwd: Some("/srv/app".into()),
                        kind: Some("ssh".into()),
                    },
                )
                .unwrap();

            let first = std::fs::read_to_string(store.path()).unwrap();
            let reopened = store_in(&dir);
            reopened.save().unwrap();
            let second = std::fs::read_to_string(store.path()).unwrap();

            let strip = |s: &str| -> String {
                s.lines()
                    .filter(|l| !l.contains("updated_at"))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            assert_eq!(strip(&first), strip(&second));
        }

        #[test]
        fn test_unknown_fields_are_ignored() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("state.json");
            std::fs::write(
                &path,
                r#"{"active_session":"local","sessions":{},"updated_at":"x","future_field":42}"#,
            )
            .unwrap();

            let store = StateStore::open(&path).unwrap();
            assert_eq!(store.get_active().as_deref(), Some("local"));
        }

        #[test]
        fn test_missing_fields_take_defaults() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("state.json");
            std::fs::write(&path, r#"{"sessions":{"web":{"type":"ssh"}}}"#).unwrap();

            let store = StateStore::open(&path).unwrap();
            let state = store.get_session_state("web").unwrap();
            assert!(!state.connected);
            assert_eq!(state.cwd, "");
            assert!(state.env.is_empty());
        }
    }

    mod default_path {
        use super::*;

        #[test]
        fn test_default_path_ends_with_state_json() {
            let path = default_state_path();
            assert!(path.ends_with("thop/state.json"));
        }
    }
}
