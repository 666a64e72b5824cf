use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs as async_fs;
use tracing::debug;

use crate::error::ReportError;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Read-only view over the durable results store.
///
/// Each subdirectory is one completed run, named after its sandbox clone.
/// Only JSON reports are exposed and every resolved path is checked to stay
/// under the store root.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

impl ReportStore {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the local artifact directory for a run
    pub async fn create_run_dir(&self, run_name: &str) -> io::Result<PathBuf> {
        let dir = self
            .lexical_join(&[run_name])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        async_fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Join client-supplied segments under the root, refusing anything that
    /// climbs above it or names an absolute location
    fn lexical_join(&self, segments: &[&str]) -> Result<PathBuf, ReportError> {
        let mut parts: Vec<OsString> = Vec::new();

        for segment in segments {
            let normalized = segment.replace('\\', "/");
            for component in Path::new(&normalized).components() {
                match component {
                    Component::Normal(part) => parts.push(part.to_os_string()),
                    Component::CurDir => {}
                    Component::ParentDir => {
                        if parts.pop().is_none() {
                            return Err(ReportError::InvalidPath(segments.join("/")));
                        }
                    }
                    Component::RootDir | Component::Prefix(_) => {
                        return Err(ReportError::InvalidPath(segments.join("/")));
                    }
                }
            }
        }

        if parts.is_empty() {
            return Err(ReportError::InvalidPath(segments.join("/")));
        }

        let mut path = self.root.clone();
        path.extend(parts);
        Ok(path)
    }

    /// Resolve symlinks and re-check containment
    async fn canonical_within_root(&self, path: &Path) -> Result<Option<PathBuf>, ReportError> {
        let canonical = match async_fs::canonicalize(path).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if canonical == self.root || !canonical.starts_with(&self.root) {
            return Err(ReportError::InvalidPath(path.display().to_string()));
        }
        Ok(Some(canonical))
    }

    /// Names of all run directories, sorted
    pub async fn list_runs(&self) -> Result<Vec<String>, ReportError> {
        let mut entries = match async_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }

        runs.sort();
        Ok(runs)
    }

    /// Relative paths (forward slashes) of every JSON report under a run
    pub async fn list_report_files(&self, run: &str) -> Result<Vec<String>, ReportError> {
        let run_dir = self.lexical_join(&[run])?;
        let run_dir = match self.canonical_within_root(&run_dir).await? {
            Some(dir) => dir,
            None => return Err(ReportError::RunNotFound(run.to_string())),
        };
        if !async_fs::metadata(&run_dir).await?.is_dir() {
            return Err(ReportError::RunNotFound(run.to_string()));
        }

        let mut files = Vec::new();
        let mut pending = vec![run_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = async_fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();

                // Symlinks are skipped so a listing never leaves the run directory
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && is_json(&path) {
                    if let Ok(relative) = path.strip_prefix(&run_dir) {
                        let relative: Vec<String> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        files.push(relative.join("/"));
                    }
                }
            }
        }

        files.sort();
        debug!("Run {} exposes {} report files", run, files.len());
        Ok(files)
    }

    /// Parse one JSON report, tolerating a leading byte-order mark
    pub async fn read_report(
        &self,
        run: &str,
        file: &str,
    ) -> Result<serde_json::Value, ReportError> {
        let candidate = self.lexical_join(&[run, file])?;
        let resolved = self
            .canonical_within_root(&candidate)
            .await?
            .ok_or_else(|| ReportError::FileNotFound(candidate.clone()))?;

        if !async_fs::metadata(&resolved).await?.is_file() {
            return Err(ReportError::FileNotFound(candidate));
        }
        if !is_json(&resolved) {
            return Err(ReportError::UnsupportedType(file.to_string()));
        }

        let bytes = async_fs::read(&resolved).await?;
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
        let text = String::from_utf8_lossy(body);

        serde_json::from_str(&text).map_err(|e| ReportError::Parse {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn store_with_run() -> (TempDir, ReportStore) {
        let temp_dir = tempdir().unwrap();
        let results = temp_dir.path().join("analysis_results");
        std::fs::create_dir_all(results.join("run-A")).unwrap();
        std::fs::write(results.join("run-A").join("report.json"), br#"{"verdict":"ok"}"#).unwrap();
        let store = ReportStore::new(&results).unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_lists_runs_and_report_files() {
        let (_guard, store) = store_with_run();

        assert_eq!(store.list_runs().await.unwrap(), vec!["run-A".to_string()]);
        assert_eq!(
            store.list_report_files("run-A").await.unwrap(),
            vec!["report.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_nested_reports_use_forward_slashes_and_skip_non_json() {
        let (_guard, store) = store_with_run();
        let nested = store.root().join("run-A").join("20240101").join("procs");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("tree.JSON"), b"[]").unwrap();
        std::fs::write(nested.join("capture.pcap"), b"\x00").unwrap();

        assert_eq!(
            store.list_report_files("run-A").await.unwrap(),
            vec!["20240101/procs/tree.JSON".to_string(), "report.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (_guard, store) = store_with_run();
        assert!(matches!(
            store.list_report_files("run-Z").await,
            Err(ReportError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_report_content() {
        let (_guard, store) = store_with_run();
        let value = store.read_report("run-A", "report.json").await.unwrap();
        assert_eq!(value, json!({ "verdict": "ok" }));
    }

    #[tokio::test]
    async fn test_traversal_is_rejected() {
        let (_guard, store) = store_with_run();

        for attempt in [
            "../../etc/passwd",
            "..\\..\\etc\\passwd",
            "/etc/passwd",
            "../run-A/../../x.json",
        ] {
            let result = store.read_report("run-A", attempt).await;
            assert!(
                matches!(result, Err(ReportError::InvalidPath(_))),
                "{} should be rejected, got {:?}",
                attempt,
                result
            );
        }
        assert!(matches!(
            store.list_report_files("..").await,
            Err(ReportError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let (guard, store) = store_with_run();
        let outside = guard.path().join("secret.json");
        std::fs::write(&outside, b"{}").unwrap();
        std::os::unix::fs::symlink(&outside, store.root().join("run-A").join("link.json")).unwrap();

        assert!(matches!(
            store.read_report("run-A", "link.json").await,
            Err(ReportError::InvalidPath(_))
        ));
        assert_eq!(
            store.list_report_files("run-A").await.unwrap(),
            vec!["report.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bom_prefixed_report_parses() {
        let (_guard, store) = store_with_run();
        let mut content = UTF8_BOM.to_vec();
        content.extend_from_slice(br#"{"processes": 3}"#);
        std::fs::write(store.root().join("run-A").join("bom.json"), content).unwrap();

        let value = store.read_report("run-A", "bom.json").await.unwrap();
        assert_eq!(value, json!({ "processes": 3 }));
    }

    #[tokio::test]
    async fn test_malformed_report_yields_parse_error() {
        let (_guard, store) = store_with_run();
        std::fs::write(store.root().join("run-A").join("broken.json"), b"{\"a\": ").unwrap();

        match store.read_report("run-A", "broken.json").await {
            Err(ReportError::Parse { message }) => assert!(!message.is_empty()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_and_missing_files() {
        let (_guard, store) = store_with_run();
        std::fs::write(store.root().join("run-A").join("notes.txt"), b"hi").unwrap();

        assert!(matches!(
            store.read_report("run-A", "notes.txt").await,
            Err(ReportError::UnsupportedType(_))
        ));
        assert!(matches!(
            store.read_report("run-A", "missing.json").await,
            Err(ReportError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_run_dir() {
        let (_guard, store) = store_with_run();
        let dir = store.create_run_dir("Windows-ent-10_Clone_x_1").await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.list_runs().await.unwrap().len(), 2);
        assert!(store.create_run_dir("../escape").await.is_err());
    }
}
