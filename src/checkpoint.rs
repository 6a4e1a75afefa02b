use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    record::RecordIdentifier,
    util::{atomic_write, remove_if_exists, timestamp},
};

/// Where a crawl stands. Ordered lexicographically by target, page, item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub target: usize,
    pub page: u32,
    pub item: u32,
}

impl Position {
    pub const FRESH: Self = Self {
        target: 0,
        page: 1,
        item: 0,
    };
}

impl Default for Position {
    fn default() -> Self {
        Self::FRESH
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointState {
    #[serde(rename = "current_url_index")]
    pub target: usize,
    #[serde(rename = "current_page")]
    pub page: u32,
    #[serde(
        rename = "last_processed_item",
        alias = "last_processed_row",
        alias = "last_processed_section"
    )]
    pub item: u32,
    #[serde(deserialize_with = "loose_id")]
    pub last_id: Option<RecordIdentifier>,
    pub last_url: Option<String>,
    pub timestamp: String,
}

/// Older checkpoint files store a numeric `last_id`, with `0` for "none yet".
fn loose_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RecordIdentifier>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(RecordIdentifier),
        Number(serde_json::Number),
    }

    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Text(id)) => Some(id),
        Some(Loose::Number(n)) if n.as_u64() != Some(0) => Some(RecordIdentifier::new(n.to_string())),
        _ => None,
    })
}

impl CheckpointState {
    pub fn at(position: Position) -> Self {
        Self {
            target: position.target,
            page: position.page,
            item: position.item,
            ..Self::default()
        }
    }

    pub const fn position(&self) -> Position {
        Position {
            target: self.target,
            page: self.page,
            item: self.item,
        }
    }
}

/// Durable crawl position. Loading never fails, saving never panics the crawl.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    high_water: Option<Position>,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            high_water: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the recorded state, or `None` (start fresh) when the file is
    /// absent or unreadable.
    pub fn load(&mut self) -> Option<CheckpointState> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(target: "checkpoint", "no checkpoint at {}, starting from the beginning", self.path.display());
                return None;
            }
            Err(err) => {
                tracing::warn!(target: "checkpoint", "cannot read {}: {err}, starting from the beginning", self.path.display());
                return None;
            }
        };

        let mut state = match serde_json::from_str::<CheckpointState>(&text) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(target: "checkpoint", "corrupt checkpoint {}: {err}, starting from the beginning", self.path.display());
                return None;
            }
        };
        if state.page == 0 {
            state.page = 1;
        }

        tracing::info!(
            target: "checkpoint",
            "\x1b[36mloaded checkpoint: target #{}, page {}, item {}\x1b[0m (last id {:?})",
            state.target, state.page, state.item, state.last_id.as_ref().map(RecordIdentifier::as_str),
        );
        self.high_water = Some(state.position());
        Some(state)
    }

    /// Stamps and persists `state`. Failures and regressions are logged and
    /// reported as `false`.
    pub fn save(&mut self, state: &mut CheckpointState) -> bool {
        let position = state.position();
        if let Some(hw) = self.high_water
            && position < hw
        {
            tracing::error!(target: "checkpoint", "refusing to move checkpoint back from {hw:?} to {position:?}");
            return false;
        }

        state.timestamp = timestamp();
        match self.write(state) {
            Ok(()) => {
                self.high_water = Some(position);
                tracing::debug!(target: "checkpoint", "saved target #{}, page {}, item {}", state.target, state.page, state.item);
                true
            }
            Err(err) => {
                tracing::error!(target: "checkpoint", "\x1b[31msaving {} failed: {err}\x1b[0m", self.path.display());
                false
            }
        }
    }

    fn write(&self, state: &CheckpointState) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
        atomic_write(&self.path, &json)
    }

    /// Forgets any recorded progress.
    pub fn clear(&mut self) -> io::Result<()> {
        self.high_water = None;
        remove_if_exists(&self.path)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointMark {
    pub last_id: Option<RecordIdentifier>,
    pub timestamp: String,
}

/// The newest identifier captured by the previous complete run. A later run
/// can stop as soon as it reaches it.
#[derive(Debug)]
pub struct PointMarkStore {
    path: PathBuf,
}

impl PointMarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Option<RecordIdentifier> {
        let text = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<PointMark>(&text) {
            Ok(mark) => {
                if let Some(id) = &mark.last_id {
                    tracing::info!(target: "point-mark", "loaded point mark \x1b[33m{id}\x1b[0m");
                }
                mark.last_id
            }
            Err(err) => {
                tracing::warn!(target: "point-mark", "ignoring corrupt point mark {}: {err}", self.path.display());
                None
            }
        }
    }

    pub fn save(&self, id: &RecordIdentifier) {
        let mark = PointMark {
            last_id: Some(id.clone()),
            timestamp: timestamp(),
        };
        let res = serde_json::to_vec_pretty(&mark)
            .map_err(io::Error::other)
            .and_then(|json| atomic_write(&self.path, &json));
        match res {
            Ok(()) => tracing::info!(target: "point-mark", "point mark saved: \x1b[33m{id}\x1b[0m"),
            Err(err) => tracing::error!(target: "point-mark", "\x1b[31msaving {} failed: {err}\x1b[0m", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(target: usize, page: u32, item: u32) -> CheckpointState {
        CheckpointState::at(Position { target, page, item })
    }

    #[test]
    fn absent_checkpoint_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProgressStore::new(dir.path().join("cp.json"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn corrupt_checkpoint_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, "{\"current_page\": 3, \"last_pro").unwrap();
        assert_eq!(ProgressStore::new(&path).load(), None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let mut store = ProgressStore::new(&path);

        let mut s = state(1, 4, 7);
        s.last_id = Some(RecordIdentifier::new("Yoga_Library_2024"));
        s.last_url = Some("https://example.org/list?page=4".into());
        assert!(store.save(&mut s));
        assert!(!s.timestamp.is_empty());

        let loaded = ProgressStore::new(&path).load().unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn on_disk_keys_are_flat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        assert!(ProgressStore::new(&path).save(&mut state(0, 2, 5)));

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["current_page"], 2);
        assert_eq!(value["last_processed_item"], 5);
        assert_eq!(value["current_url_index"], 0);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn legacy_file_without_optional_keys_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, r#"{"current_page": 3, "last_processed_item": 2, "page_type": "next"}"#).unwrap();
        let loaded = ProgressStore::new(&path).load().unwrap();
        assert_eq!(loaded.position(), Position { target: 0, page: 3, item: 2 });

        fs::write(
            &path,
            r#"{"current_page": 3, "last_processed_row": 5, "last_id": 0, "timestamp": "2024-05-01T10:00:00"}"#,
        )
        .unwrap();
        let loaded = ProgressStore::new(&path).load().unwrap();
        assert_eq!(loaded.position(), Position { target: 0, page: 3, item: 5 });
        assert_eq!(loaded.last_id, None);

        fs::write(&path, r#"{"current_page": 2, "last_processed_section": 4, "last_id": 17}"#).unwrap();
        let loaded = ProgressStore::new(&path).load().unwrap();
        assert_eq!(loaded.position(), Position { target: 0, page: 2, item: 4 });
        assert_eq!(loaded.last_id, Some(RecordIdentifier::new("17")));
    }

    #[test]
    fn refuses_to_regress() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProgressStore::new(dir.path().join("cp.json"));
        assert!(store.save(&mut state(0, 2, 3)));
        assert!(store.save(&mut state(0, 2, 3)));
        assert!(!store.save(&mut state(0, 1, 9)));
        assert!(store.save(&mut state(1, 1, 0)));
        assert_eq!(store.load().unwrap().position(), Position { target: 1, page: 1, item: 0 });
    }

    #[test]
    fn clear_allows_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProgressStore::new(dir.path().join("cp.json"));
        assert!(store.save(&mut state(0, 5, 1)));
        store.clear().unwrap();
        assert_eq!(store.load(), None);
        assert!(store.save(&mut state(0, 1, 1)));
    }

    #[test]
    fn failed_save_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("cp.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();
        assert!(!ProgressStore::new(&path).save(&mut state(0, 1, 1)));
    }

    #[test]
    fn point_mark_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let marks = PointMarkStore::new(dir.path().join("mark.json"));
        assert_eq!(marks.load(), None);
        marks.save(&RecordIdentifier::new("A_B_C"));
        assert_eq!(marks.load(), Some(RecordIdentifier::new("A_B_C")));
    }
}
