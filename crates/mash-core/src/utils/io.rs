use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{trace, warn};

static UNIQUE_NAMES: Mutex<()> = Mutex::const_new(());

/// Relative folder named after the local time, down to the millisecond.
///
/// Calls are serialized and spaced by a few milliseconds, so two calls of the
/// same process never return the same name.
pub async fn generate_unique_folder_name() -> String {
    let _guard = UNIQUE_NAMES.lock().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Wait until the lock on `path` is ours. The file is created if needed.
    pub async fn acquire(path: &Path) -> io::Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir)?;
            }
            let file = File::options()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock()?;
            trace!(path = %path.display(), "lock acquired");
            Ok(Self { file, path })
        })
        .await
        .map_err(io::Error::other)?
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "cannot release the lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unique_names_differ() {
        let a = generate_unique_folder_name().await;
        let b = generate_unique_folder_name().await;
        assert_ne!(a, b);
        assert_eq!(a.split('/').count(), 7);
    }

    #[tokio::test]
    async fn lock_can_be_taken_again_once_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("dataReports.lock");

        let lock = LockFile::acquire(&path).await.unwrap();
        assert!(path.exists());
        drop(lock);

        let _again = LockFile::acquire(&path).await.unwrap();
    }
}
