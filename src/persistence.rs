use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::recommendations::AnalysisRun;
use crate::store::StoredRecommendation;

/// On-disk layout of the result store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub recommendations: Vec<StoredRecommendation>,
    #[serde(default)]
    pub runs: Vec<AnalysisRun>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn state_file_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

/// Read `<dir>/state.json`; `Ok(None)` on first run.
pub async fn load_if_exists(dir: &Path) -> Result<Option<PersistedState>, PersistenceError> {
    let path = state_file_path(dir);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let persisted = serde_json::from_slice::<PersistedState>(&bytes).map_err(|source| {
                PersistenceError::Format {
                    path: path.clone(),
                    source,
                }
            })?;
            info!(
                file = ?path,
                recommendations = persisted.recommendations.len(),
                runs = persisted.runs.len(),
                "loaded persisted state"
            );
            Ok(Some(persisted))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(file = ?path, "no persisted state found (first run?)");
            Ok(None)
        }
        Err(source) => Err(PersistenceError::Io { path, source }),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { path, source }
}

/// Write the state atomically: `state.json.tmp` then rename over `state.json`.
pub async fn write_atomic(dir: &Path, state: &PersistedState) -> Result<(), PersistenceError> {
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    let path = state_file_path(dir);
    let json = serde_json::to_vec_pretty(state).map_err(|source| PersistenceError::Format {
        path: path.clone(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))?;
    debug!(file = ?path, size = json.len(), "flushed persisted state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_if_exists(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path(), &PersistedState::default())
            .await
            .expect("write ok");
        assert!(state_file_path(dir.path()).exists());
        assert!(!dir.path().join("state.json.tmp").exists());
        let loaded = load_if_exists(dir.path()).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(state_file_path(dir.path()), b"{not json").unwrap();
        let err = load_if_exists(dir.path()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Format { .. }));
    }
}
