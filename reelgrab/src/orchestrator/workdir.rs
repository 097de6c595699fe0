use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::utils::fs::{ensure_dir_all_with_op, io_error};

/// A job-scoped working directory, removed exactly once.
///
/// [`WorkDir::close`] is the normal path. Dropping an open guard removes the
/// directory synchronously, which covers panics and aborted tasks.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    pub async fn create(root: &Path, job_id: Uuid) -> Result<Self> {
        let path = root.join(format!("job-{}", job_id.simple()));
        ensure_dir_all_with_op("creating job directory", &path).await?;
        debug!(path = %path.display(), "job directory created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(mut self) -> Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "job directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing job directory", &self.path, e)),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove job directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_removes_contents() {
        let root = tempfile::tempdir().unwrap();
        let dir = WorkDir::create(root.path(), Uuid::new_v4()).await.unwrap();
        let path = dir.path().to_path_buf();
        std::fs::create_dir_all(path.join("gallery")).unwrap();
        std::fs::write(path.join("gallery/1.jpg"), b"x").unwrap();

        dir.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_unclosed_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = WorkDir::create(root.path(), Uuid::new_v4()).await.unwrap();
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn close_tolerates_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = WorkDir::create(root.path(), Uuid::new_v4()).await.unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(dir.close().await.is_ok());
    }
}
