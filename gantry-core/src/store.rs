//! Filesystem-backed implementation of the state port.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/tasks/<task-id>.json
//! <state_dir>/workers/<worker-id>.json
//! <state_dir>/workspaces/<task-id>.json
//! <state_dir>/planner.json
//! ```
//!
//! Records are pretty-printed JSON written atomically (temp file + rename),
//! so readers always see either the old complete record or the new one.

use std::fs;
use std::io::{self, Write as IoWrite};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{PlannerState, TaskId, TaskRecord, WorkerRecord, WorkspaceInfo};
use crate::ports::StatePort;

/// Write `content` to `path` atomically using a temp file + rename.
///
/// On POSIX, `rename(2)` within the same directory is atomic, so a crash
/// mid-write can never leave a truncated record behind.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    // Temp file lives in the same directory so the rename stays on one fs.
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Map an arbitrary record key onto a safe file stem.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct FileStateStore {
    tasks_dir: PathBuf,
    workers_dir: PathBuf,
    workspaces_dir: PathBuf,
    planner_path: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            tasks_dir: state_dir.join("tasks"),
            workers_dir: state_dir.join("workers"),
            workspaces_dir: state_dir.join("workspaces"),
            planner_path: state_dir.join("planner.json"),
        }
    }

    fn write_record<T: Serialize>(dir: &Path, key: &str, record: &T) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", sanitize_key(key)));
        let content = serde_json::to_string_pretty(record)?;
        atomic_write(&path, &content)
    }

    fn read_record<T: DeserializeOwned>(dir: &Path, key: &str) -> Result<Option<T>> {
        let path = dir.join(format!("{}.json", sanitize_key(key)));
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_record(dir: &Path, key: &str) -> Result<()> {
        let path = dir.join(format!("{}.json", sanitize_key(key)));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every record in `dir`, skipping files that fail to parse so one
    /// corrupt record cannot take the whole listing down.
    fn list_records<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            match serde_json::from_str(&content) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("skipping unreadable record {}: {e}", path.display()),
            }
        }
        Ok(records)
    }
}

impl StatePort for FileStateStore {
    fn put_task(&self, record: &TaskRecord) -> Result<()> {
        Self::write_record(&self.tasks_dir, record.task_id.as_str(), record)
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        Self::read_record(&self.tasks_dir, task_id.as_str())
    }

    fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        Self::list_records(&self.tasks_dir)
    }

    fn delete_task(&self, task_id: &TaskId) -> Result<()> {
        Self::delete_record(&self.tasks_dir, task_id.as_str())
    }

    fn put_worker(&self, record: &WorkerRecord) -> Result<()> {
        Self::write_record(&self.workers_dir, &record.worker_id, record)
    }

    fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        Self::read_record(&self.workers_dir, worker_id)
    }

    fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        Self::list_records(&self.workers_dir)
    }

    fn delete_worker(&self, worker_id: &str) -> Result<()> {
        Self::delete_record(&self.workers_dir, worker_id)
    }

    fn put_workspace(&self, info: &WorkspaceInfo) -> Result<()> {
        Self::write_record(&self.workspaces_dir, info.task_id.as_str(), info)
    }

    fn get_workspace(&self, task_id: &TaskId) -> Result<Option<WorkspaceInfo>> {
        Self::read_record(&self.workspaces_dir, task_id.as_str())
    }

    fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>> {
        Self::list_records(&self.workspaces_dir)
    }

    fn delete_workspace(&self, task_id: &TaskId) -> Result<()> {
        Self::delete_record(&self.workspaces_dir, task_id.as_str())
    }

    fn put_planner_state(&self, state: &PlannerState) -> Result<()> {
        if let Some(parent) = self.planner_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        atomic_write(&self.planner_path, &content)
    }

    fn get_planner_state(&self) -> Result<Option<PlannerState>> {
        match fs::read_to_string(&self.planner_path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
