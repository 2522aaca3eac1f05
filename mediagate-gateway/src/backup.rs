//! On-demand snapshot backups of the working tree.
//!
//! Each request produces a uniquely named `.tar.gz` archive of the
//! configured root, excluding anything reproducible or noisy: dependency
//! and build directories, temp/cache directories, the cache database,
//! prior backup artifacts, VCS metadata, lockfiles, and log files. The
//! archive is staged on disk, streamed to the client as an attachment,
//! and removed once delivery finishes — on every exit path, including
//! failed or abandoned downloads.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::StreamExt;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use hyper::header;
use hyper::{Response, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use walkdir::WalkDir;

use mediagate_core::error::{GatewayError, GatewayResult};

use crate::service::UnifiedBody;

/// Directory names never captured in a snapshot.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    ".hg",
    ".svn",
    "tmp",
    "temp",
    ".cache",
    "__pycache__",
];

/// File names (exact) never captured in a snapshot.
const EXCLUDED_FILES: &[&str] = &[
    "cache.db",
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
];

/// A finished backup artifact awaiting delivery.
#[derive(Debug)]
pub struct BackupJob {
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl BackupJob {
    pub fn file_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.tar.gz".to_string())
    }
}

/// Builds and delivers working-tree snapshots.
#[derive(Debug, Clone)]
pub struct BackupArchiver {
    root: PathBuf,
    staging: PathBuf,
}

impl BackupArchiver {
    pub fn new(root: PathBuf, staging: PathBuf) -> Self {
        Self { root, staging }
    }

    /// Build a new archive under the staging directory.
    ///
    /// Runs the tree walk and compression on the blocking pool. A partial
    /// artifact left behind by a failed build is removed before returning.
    pub async fn create(&self) -> GatewayResult<BackupJob> {
        let root = self.root.clone();
        let staging = self.staging.clone();
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "backup-{}-{}.tar.gz",
            Utc::now().format("%Y%m%d%H%M%S"),
            &unique[..8]
        );
        let dest = staging.join(file_name);

        let dest_for_build = dest.clone();
        let result = tokio::task::spawn_blocking(move || {
            build_archive(&root, &staging, &dest_for_build)
        })
        .await
        .map_err(|e| GatewayError::Backup(format!("archive task failed: {e}")))?;

        match result {
            Ok(entries) => {
                let size_bytes = std::fs::metadata(&dest)
                    .map(|m| m.len())
                    .map_err(|e| GatewayError::Backup(format!("archive missing after build: {e}")))?;
                info!(
                    archive = %dest.display(),
                    entries,
                    size_bytes,
                    "Backup archive created"
                );
                Ok(BackupJob {
                    archive_path: dest,
                    created_at: Utc::now(),
                    size_bytes,
                })
            }
            Err(e) => {
                // Do not leave partial artifacts in staging.
                if dest.exists() {
                    let _ = std::fs::remove_file(&dest);
                }
                Err(e)
            }
        }
    }

    /// Stream a finished archive as an attachment.
    ///
    /// The artifact is deleted when the response body is dropped — whether
    /// the download completed or the client went away mid-transfer.
    pub async fn deliver(&self, job: BackupJob) -> GatewayResult<Response<UnifiedBody>> {
        let file = tokio::fs::File::open(&job.archive_path).await.map_err(|e| {
            let _ = std::fs::remove_file(&job.archive_path);
            GatewayError::Backup(format!("failed to open archive: {e}"))
        })?;

        let guard = RemoveOnDrop {
            path: job.archive_path.clone(),
        };
        let stream = ReaderStream::new(file).map(move |chunk| {
            // The guard lives inside this closure; it is dropped (and the
            // artifact removed) when the body itself is dropped.
            let _held = &guard;
            chunk
                .map(Frame::data)
                .map_err(|e| GatewayError::Backup(format!("archive read failed: {e}")))
        });
        let body: UnifiedBody = BodyExt::boxed(StreamBody::new(stream));

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/gzip")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", job.file_name()),
            )
            .header(header::CONTENT_LENGTH, job.size_bytes)
            .body(body)
            .map_err(|e| GatewayError::Backup(format!("failed to build backup response: {e}")))
    }
}

struct RemoveOnDrop {
    path: PathBuf,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove backup artifact");
            }
        }
    }
}

fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

fn is_excluded_file(name: &str) -> bool {
    EXCLUDED_FILES.contains(&name)
        || name.ends_with(".log")
        || (name.starts_with("backup-") && name.ends_with(".tar.gz"))
}

/// Walk `root` and write the filtered tree into a gzip'd tar at `dest`.
///
/// Returns the number of file entries captured.
fn build_archive(root: &Path, staging: &Path, dest: &Path) -> GatewayResult<usize> {
    if !root.is_dir() {
        return Err(GatewayError::Backup(format!(
            "backup root {} is not a directory",
            root.display()
        )));
    }

    let file = File::create(dest)
        .map_err(|e| GatewayError::Backup(format!("failed to create archive: {e}")))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut entries = 0usize;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            // Never descend into the staging area or an excluded directory.
            if entry.path().starts_with(staging) {
                return false;
            }
            if entry.file_type().is_dir() {
                return !is_excluded_dir(&entry.file_name().to_string_lossy());
            }
            true
        });

    for entry in walker {
        let entry =
            entry.map_err(|e| GatewayError::Backup(format!("tree walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_excluded_file(&name) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| GatewayError::Backup(format!("path outside backup root: {e}")))?;
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(|e| GatewayError::Backup(format!("failed to append {}: {e}", name)))?;
        entries += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| GatewayError::Backup(format!("failed to finalize archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| GatewayError::Backup(format!("failed to flush archive: {e}")))?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn archive_entry_names(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn populate_tree(root: &Path) {
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("app.js"), "console.log('hi')").unwrap();
        std::fs::write(root.join("data/keep.txt"), "keep me").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "skip").unwrap();
        std::fs::write(root.join("target/debug/bin"), "skip").unwrap();
        std::fs::write(root.join(".git/config"), "skip").unwrap();
        std::fs::write(root.join("cache.db"), "skip").unwrap();
        std::fs::write(root.join("service.log"), "skip").unwrap();
        std::fs::write(root.join("package-lock.json"), "skip").unwrap();
        std::fs::write(root.join("backup-20240101000000-deadbeef.tar.gz"), "skip").unwrap();
    }

    #[tokio::test]
    async fn test_archive_captures_tree_and_honors_exclusions() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        populate_tree(root.path());

        let archiver = BackupArchiver::new(root.path().into(), staging.path().into());
        let job = archiver.create().await.unwrap();

        assert!(job.archive_path.exists());
        assert!(job.size_bytes > 0);
        assert!(job.file_name().starts_with("backup-"));
        assert!(job.file_name().ends_with(".tar.gz"));

        let names = archive_entry_names(&job.archive_path);
        assert!(names.contains(&"app.js".to_string()));
        assert!(names.contains(&"data/keep.txt".to_string()));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
        assert!(!names.iter().any(|n| n.contains("target")));
        assert!(!names.iter().any(|n| n.contains(".git")));
        assert!(!names.iter().any(|n| n.contains("cache.db")));
        assert!(!names.iter().any(|n| n.ends_with(".log")));
        assert!(!names.iter().any(|n| n.contains("package-lock")));
        assert!(!names.iter().any(|n| n.ends_with(".tar.gz")));
    }

    #[tokio::test]
    async fn test_artifact_removed_after_delivery() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file.txt"), "content").unwrap();

        let archiver = BackupArchiver::new(root.path().into(), staging.path().into());
        let job = archiver.create().await.unwrap();
        let archive_path = job.archive_path.clone();

        let response = archiver.deliver(job).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/gzip"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"backup-"));

        let collected = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!collected.is_empty());

        // The body (and its cleanup guard) has been dropped by collect().
        assert!(!archive_path.exists());
    }

    #[tokio::test]
    async fn test_artifact_removed_when_delivery_abandoned() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file.txt"), "content").unwrap();

        let archiver = BackupArchiver::new(root.path().into(), staging.path().into());
        let job = archiver.create().await.unwrap();
        let archive_path = job.archive_path.clone();

        let response = archiver.deliver(job).await.unwrap();
        // Client disconnects before reading a single byte.
        drop(response);

        assert!(!archive_path.exists());
    }

    #[tokio::test]
    async fn test_missing_root_fails_without_artifact() {
        let staging = tempfile::tempdir().unwrap();
        let archiver = BackupArchiver::new(
            PathBuf::from("/definitely/not/a/real/tree"),
            staging.path().into(),
        );

        let result = archiver.create().await;
        assert!(matches!(result, Err(GatewayError::Backup(_))));

        // Staging stays empty on failure.
        let leftovers: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_backups_get_unique_names() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file.txt"), "content").unwrap();

        let archiver = BackupArchiver::new(root.path().into(), staging.path().into());
        let (a, b) = tokio::join!(archiver.create(), archiver.create());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.archive_path, b.archive_path);
        assert!(a.archive_path.exists());
        assert!(b.archive_path.exists());
    }
}
