use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::RwLock;
use thiserror::Error;

use cronwork_models::TaskArgs;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The worker's persistent task map. All mutation goes through
/// `update`/`update_task` under the exclusive lock; `sync` flushes the
/// whole map to disk. A crash between the two loses the most recent
/// changes but never corrupts previously synced state, because the file
/// is replaced atomically via a temp-file rename.
pub struct TaskStore {
    path: PathBuf,
    tasks: RwLock<HashMap<String, TaskArgs>>,
}

impl TaskStore {
    /// Load the store from `path`. A missing file yields an empty map.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    /// Apply a mutator to the task map under the exclusive lock.
    pub fn update<F, R>(&self, mutator: F) -> R
    where
        F: FnOnce(&mut HashMap<String, TaskArgs>) -> R,
    {
        let mut guard = self.tasks.write();
        mutator(&mut guard)
    }

    /// Mutate a single record; returns false when the id is absent.
    pub fn update_task<F>(&self, id: &str, mutator: F) -> bool
    where
        F: FnOnce(&mut TaskArgs),
    {
        let mut guard = self.tasks.write();
        match guard.get_mut(id) {
            Some(task) => {
                mutator(task);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<TaskArgs> {
        self.tasks.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.read().contains_key(id)
    }

    pub fn all(&self) -> Vec<TaskArgs> {
        self.tasks.read().values().cloned().collect()
    }

    /// Flush the map to disk, replacing the previous file atomically.
    pub fn sync(&self) -> Result<(), StoreError> {
        let snapshot = {
            let guard = self.tasks.read();
            serde_json::to_string_pretty(&*guard)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, snapshot).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!("Synced task store to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronwork_models::{TaskState, TimeoutAction};

    fn task(id: &str) -> TaskArgs {
        TaskArgs {
            id: id.into(),
            name: format!("task-{id}"),
            command: "/bin/true".into(),
            args: String::new(),
            cron_expr: "* * * * *".into(),
            state: TaskState::Idle,
            timeout: 0,
            op_timeout: TimeoutAction::Ignore,
            max_concurrent: 1,
            number_process: 0,
            last_exec_time: 0,
            last_cost_time: 0,
            mail_to: vec![],
        }
    }

    fn temp_store_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cronwork-store-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn update_sync_load_round_trip() {
        let path = temp_store_path("roundtrip");
        let store = TaskStore::load(&path).expect("load empty");
        store.update(|tasks| {
            tasks.insert("a".into(), task("a"));
        });
        store.update_task("a", |t| t.last_exec_time = 1234);
        store.sync().expect("sync");

        let reloaded = TaskStore::load(&path).expect("reload");
        let record = reloaded.get("a").expect("record present");
        assert_eq!(record.last_exec_time, 1234);
        assert_eq!(record.state, TaskState::Idle);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn delete_survives_sync() {
        let path = temp_store_path("delete");
        let store = TaskStore::load(&path).expect("load empty");
        store.update(|tasks| {
            tasks.insert("a".into(), task("a"));
            tasks.insert("b".into(), task("b"));
        });
        store.sync().expect("sync");

        store.update(|tasks| {
            tasks.remove("a");
        });
        store.sync().expect("sync after delete");

        let reloaded = TaskStore::load(&path).expect("reload");
        assert!(reloaded.get("a").is_none());
        assert!(reloaded.get("b").is_some());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn update_task_reports_missing_id() {
        let path = temp_store_path("missing");
        let store = TaskStore::load(&path).expect("load empty");
        assert!(!store.update_task("nope", |_| {}));
    }

    #[test]
    fn sync_leaves_no_temp_file() {
        let path = temp_store_path("tmpfile");
        let store = TaskStore::load(&path).expect("load empty");
        store.update(|tasks| {
            tasks.insert("a".into(), task("a"));
        });
        store.sync().expect("sync");
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        fs::remove_file(&path).ok();
    }
}
