use md5::Md5;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A sample written to the staging area for the duration of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSample {
    /// Absolute host path handed to the control plane
    pub path: PathBuf,
    /// Base name the sample keeps inside the guest
    pub file_name: String,
    pub file_size: u64,
    pub sha256_hash: String,
    pub md5_hash: String,
}

/// Short-lived local storage for uploaded samples
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

/// Reduce an uploaded filename to its last path component.
///
/// Both separators are honoured since browsers on Windows may send full paths.
pub fn safe_file_name(original_name: &str) -> Option<String> {
    let normalized = original_name.replace('\\', "/");
    Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
}

impl StagingArea {
    /// Create the staging directory if needed and pin it to an absolute path
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist sample bytes and compute the paths and digests the run needs
    pub async fn stage(&self, original_name: &str, data: &[u8]) -> io::Result<StagedSample> {
        let file_name = safe_file_name(original_name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable sample filename '{}'", original_name),
            )
        })?;

        // Prefixed so equal names from one batch never share a staging file
        let prefix = Uuid::new_v4().simple().to_string();
        let path = self.root.join(format!("{}_{}", &prefix[..8], file_name));
        if let Err(e) = async_fs::write(&path, data).await {
            discard_partial(&path).await;
            return Err(e);
        }

        let staged = StagedSample {
            path,
            file_name,
            file_size: data.len() as u64,
            sha256_hash: calculate_sha256(data),
            md5_hash: calculate_md5(data),
        };

        info!(
            file = %staged.file_name,
            size = staged.file_size,
            sha256 = %staged.sha256_hash,
            md5 = %staged.md5_hash,
            "Sample staged"
        );

        Ok(staged)
    }

    /// Delete a staged sample; returns whether a file was actually removed
    pub async fn remove(&self, staged: &StagedSample) -> io::Result<bool> {
        match async_fs::remove_file(&staged.path).await {
            Ok(()) => {
                debug!("Removed staged sample {}", staged.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// A failed write may leave a truncated file behind
async fn discard_partial(path: &Path) {
    match async_fs::remove_file(path).await {
        Ok(()) => debug!("Discarded partial sample {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard partial sample {}: {}", path.display(), e),
    }
}

/// Calculate SHA256 hash of file data
fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Calculate MD5 hash of file data
fn calculate_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_safe_file_name_strips_directories() {
        assert_eq!(safe_file_name("sample1.zip").as_deref(), Some("sample1.zip"));
        assert_eq!(safe_file_name("../../etc/evil.zip").as_deref(), Some("evil.zip"));
        assert_eq!(
            safe_file_name("C:\\Users\\me\\Downloads\\x.7z").as_deref(),
            Some("x.7z")
        );
        assert_eq!(safe_file_name(""), None);
        assert_eq!(safe_file_name(".."), None);
    }

    #[tokio::test]
    async fn test_stage_and_remove() {
        let temp_dir = tempdir().unwrap();
        let staging = StagingArea::new(temp_dir.path().join("uploads")).unwrap();

        let staged = staging.stage("sample1.zip", b"PK\x03\x04test").await.unwrap();
        assert!(staged.path.is_absolute());
        assert!(staged.path.starts_with(staging.root()));
        assert_eq!(staged.file_name, "sample1.zip");
        assert_eq!(staged.file_size, 8);
        assert_eq!(staged.sha256_hash.len(), 64);
        assert_eq!(staged.md5_hash.len(), 32);
        assert_eq!(tokio::fs::read(&staged.path).await.unwrap(), b"PK\x03\x04test");

        assert!(staging.remove(&staged).await.unwrap());
        assert!(!staged.path.exists());
        assert!(!staging.remove(&staged).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_name_gets_distinct_staging_paths() {
        let temp_dir = tempdir().unwrap();
        let staging = StagingArea::new(temp_dir.path()).unwrap();

        let a = staging.stage("dup.zip", b"a").await.unwrap();
        let b = staging.stage("dup.zip", b"b").await.unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(a.file_name, b.file_name);
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_nothing_behind() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("uploads");
        let staging = StagingArea::new(&root).unwrap();
        std::fs::remove_dir(&root).unwrap();

        assert!(staging.stage("sample1.zip", b"PK").await.is_err());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_discard_partial_removes_truncated_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("1234abcd_sample1.zip");
        std::fs::write(&path, b"PK\x03").unwrap();

        discard_partial(&path).await;
        assert!(!path.exists());
        // Already gone is fine
        discard_partial(&path).await;
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            calculate_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(calculate_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
