use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use matforge_types::{OrchestratorState, PlannerEvent};

use crate::error::{PlannerError, Result};

const RUNS_SUBDIR: &str = ".matforge/runs";
const STATE_FILE: &str = "state.json";
const EVENTS_FILE: &str = "events.log";
const SUMMARY_FILE: &str = "latest_summary.md";

/// On-disk persistence for orchestrator runs, rooted at the research
/// workspace. Layout:
///
/// ```text
/// <workspace>/.matforge/runs/<run_key>/state.json
/// <workspace>/.matforge/runs/<run_key>/events.log
/// <workspace>/.matforge/runs/<run_key>/latest_summary.md
/// ```
pub struct PlanStore {
    workspace_root: PathBuf,
}

impl PlanStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn run_dir(&self, run_key: &str) -> PathBuf {
        self.workspace_root.join(RUNS_SUBDIR).join(run_key)
    }

    /// Persist the full state document. Atomic: a crash mid-write never
    /// corrupts the previous state.
    pub fn save_state(&self, state: &OrchestratorState) -> Result<()> {
        let dir = self.run_dir(&state.run_key);
        fs::create_dir_all(&dir)?;
        let raw = serde_json::to_vec_pretty(state)?;
        atomic_write(&dir.join(STATE_FILE), &raw)
    }

    pub fn load_state(&self, run_key: &str) -> Result<Option<OrchestratorState>> {
        let path = self.run_dir(run_key).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    pub fn append_event(&self, run_key: &str, event: &PlannerEvent) -> Result<()> {
        let dir = self.run_dir(run_key);
        fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read back the event log, skipping lines that fail to parse so a
    /// torn tail write never makes the whole history unreadable.
    pub fn load_events(&self, run_key: &str) -> Result<Vec<PlannerEvent>> {
        let path = self.run_dir(run_key).join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(run_key = %run_key, "skipping unreadable event line: {}", err);
                }
            }
        }
        Ok(events)
    }

    pub fn save_summary(&self, run_key: &str, markdown: &str) -> Result<()> {
        let dir = self.run_dir(run_key);
        fs::create_dir_all(&dir)?;
        atomic_write(&dir.join(SUMMARY_FILE), markdown.as_bytes())
    }

    pub fn run_exists(&self, run_key: &str) -> bool {
        self.run_dir(run_key).join(STATE_FILE).exists()
    }

    pub fn list_runs(&self) -> Result<Vec<String>> {
        let base = self.workspace_root.join(RUNS_SUBDIR);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                runs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }

    pub fn delete_run(&self, run_key: &str) -> Result<()> {
        let dir = self.run_dir(run_key);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Short listing of workspace files for readiness assessment,
    /// honoring .gitignore and capped so the prompt stays bounded.
    pub fn workspace_listing(&self, limit: usize) -> String {
        let mut names: Vec<String> = Vec::new();
        for entry in ignore::WalkBuilder::new(&self.workspace_root)
            .hidden(true)
            .max_depth(Some(3))
            .build()
            .flatten()
        {
            if names.len() >= limit {
                break;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Ok(rel) = entry.path().strip_prefix(&self.workspace_root) {
                    names.push(rel.to_string_lossy().to_string());
                }
            }
        }
        names.sort();
        names.join("\n")
    }
}

/// Write to a sibling temp file, then rename over the target.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        PlannerError::InvalidOperation(format!("no parent directory for {}", path.display()))
    })?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, contents)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use matforge_types::{Phase, PlannerConfig};

    fn store() -> (tempfile::TempDir, PlanStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn state_round_trips_and_overwrites_atomically() {
        let (_dir, store) = store();
        let mut state = OrchestratorState::new("band gap of Si", PlannerConfig::default());
        store.save_state(&state).expect("save");

        state.phase = Phase::Planning;
        store.save_state(&state).expect("save again");

        let loaded = store
            .load_state(&state.run_key)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.phase, Phase::Planning);
        assert_eq!(loaded.goal, "band gap of Si");

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(store.run_dir(&state.run_key))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_state_loads_as_none() {
        let (_dir, store) = store();
        assert!(store.load_state("no-such-run").expect("load").is_none());
        assert!(!store.run_exists("no-such-run"));
    }

    #[test]
    fn events_append_and_tolerate_torn_lines() {
        let (_dir, store) = store();
        let event = PlannerEvent::RunCreated {
            run_key: "r-1".to_string(),
            goal: "g".to_string(),
            timestamp: Utc::now(),
        };
        store.append_event("r-1", &event).expect("append");
        store.append_event("r-1", &event).expect("append");

        // Simulate a torn write at the tail.
        let path = store.run_dir("r-1").join(EVENTS_FILE);
        let mut raw = fs::read_to_string(&path).expect("read");
        raw.push_str("{\"type\":\"run_crea");
        fs::write(&path, raw).expect("write");

        let events = store.load_events("r-1").expect("load");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn list_and_delete_runs() {
        let (_dir, store) = store();
        for key in ["b-run", "a-run"] {
            let mut state = OrchestratorState::new("g", PlannerConfig::default());
            state.run_key = key.to_string();
            store.save_state(&state).expect("save");
        }
        assert_eq!(store.list_runs().expect("list"), vec!["a-run", "b-run"]);

        store.delete_run("a-run").expect("delete");
        assert_eq!(store.list_runs().expect("list"), vec!["b-run"]);
    }
}
