//! Persisted job list.

use std::path::{Path, PathBuf};

use scan_pool_types::Job;
use tracing::debug;

use crate::error::{CoordinatorError, Result};
use crate::lock::WriteLock;

/// Writes full job-list snapshots under a [`WriteLock`].
///
/// Each save goes to `<file>.tmp` and is renamed over the target, so a
/// reader sees either the previous snapshot or the new one.
pub struct JobStore {
    path: PathBuf,
    lock: WriteLock,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: WriteLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &WriteLock {
        &self.lock
    }

    /// Take the lock, then build and write the snapshot. Building inside the
    /// lock means the last writer always writes the newest state.
    pub async fn save_with<F>(&self, snapshot: F) -> Result<usize>
    where
        F: FnOnce() -> Vec<Job>,
    {
        let _guard = self.lock.acquire().await;
        let jobs = snapshot();
        let content = serde_json::to_string_pretty(&jobs).map_err(CoordinatorError::Encode)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoordinatorError::io(parent, e))?;
        }
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| CoordinatorError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CoordinatorError::io(&self.path, e))?;

        debug!(jobs = jobs.len(), path = %self.path.display(), "job list saved");
        Ok(jobs.len())
    }

    pub async fn save(&self, jobs: &[Job]) -> Result<usize> {
        self.save_with(|| jobs.to_vec()).await
    }

    /// Read the last snapshot. A missing file is an empty list.
    pub async fn load(&self) -> Result<Vec<Job>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoordinatorError::io(&self.path, e)),
        };
        serde_json::from_str(&content).map_err(CoordinatorError::Parse)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scan_pool_types::{FoundInfo, JobOptions, JobStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("state/jobs.json"));

        let mut job = Job::new("north-east", JobOptions::cube(-500, 500, 0, 1000));
        job.found.push(FoundInfo {
            x: 12,
            z: 800,
            date: Some(1_700_000_000_000),
        });
        job.status = JobStatus::Finished;

        assert_eq!(store.save(&[job.clone()]).await.unwrap(), 1);
        assert!(!dir.path().join("state/jobs.json.tmp").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, job.id);
        assert_eq!(loaded[0].found, job.found);
        assert_eq!(loaded[0].status, JobStatus::Finished);
        assert_eq!(loaded[0].job_options, job.job_options);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "[{\"id\":").unwrap();
        let store = JobStore::new(path);
        assert!(matches!(
            store.load().await.unwrap_err(),
            CoordinatorError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn test_save_waits_for_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        let held = store.lock().try_acquire().unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.save(&[]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!store.path().exists(), "write must wait for the lock");

        held.release();
        writer.await.unwrap().unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_valid_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));

        let mut tasks = Vec::new();
        for n in 0..10 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let jobs: Vec<Job> = (0..n)
                    .map(|i| Job::new(format!("job-{i}"), JobOptions::spiral(i, None)))
                    .collect();
                store.save(&jobs).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // whichever write landed last, the file parses completely
        let loaded = store.load().await.unwrap();
        assert!(loaded.len() < 10);
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/var/pool/jobs.json")),
            PathBuf::from("/var/pool/jobs.json.tmp")
        );
    }
}
