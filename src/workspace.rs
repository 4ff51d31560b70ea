//! Per-cycle working directories.
//!
//! Every capture cycle gets its own directory under the work root, so detector
//! output from one cycle can never be overwritten by the next. Directories left
//! behind by failed uploads are kept for a while and pruned oldest-first once
//! more than `max_retained` of them pile up.

use crate::error::{CleanupError, OccucamError, RedactionError, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "cycle-";

/// True when `name` is exactly one ordinary file name: no separators, no `.`/`..`
pub fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Scratch directory owned by one in-flight cycle
#[derive(Debug)]
pub struct Workspace {
    cycle_id: String,
    dir: PathBuf,
    active: Option<Arc<Mutex<HashSet<String>>>>,
}

impl Workspace {
    /// Workspace that is not tracked by an arena
    pub fn new(cycle_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            dir: dir.into(),
            active: None,
        }
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a captured file named `file_name` is stored
    pub fn image_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Root of everything the detector writes
    pub fn runs_dir(&self) -> PathBuf {
        self.dir.join("runs")
    }

    /// Project directory handed to the detector
    pub fn detect_project(&self) -> PathBuf {
        self.runs_dir().join("detect")
    }

    /// Run directory inside the project (fixed name, reused with exist-ok)
    pub fn detect_dir(&self) -> PathBuf {
        self.detect_project().join("exp")
    }

    /// Label file the detector writes for `image`
    pub fn label_path(&self, image: &Path) -> PathBuf {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.detect_dir().join("labels").join(format!("{}.txt", stem))
    }

    /// Annotated copy of `image` written by the detector
    pub fn annotated_image(&self, image: &Path) -> PathBuf {
        match image.file_name() {
            Some(name) => self.detect_dir().join(name),
            None => self.detect_dir().join("annotated"),
        }
    }

    /// Output path for the redacted artifact. `blob_name` must be a plain file name
    /// so the output stays inside the workspace.
    pub fn redacted_output(&self, blob_name: &str) -> std::result::Result<PathBuf, RedactionError> {
        if !is_plain_file_name(blob_name) {
            return Err(RedactionError::InvalidOutputName {
                name: blob_name.to_string(),
            });
        }
        Ok(self.detect_dir().join(blob_name))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            if let Ok(mut active) = active.lock() {
                active.remove(&self.cycle_id);
            }
        }
    }
}

/// Result of a pruning pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Allocates per-cycle workspaces and bounds how many stale ones survive
#[derive(Debug, Clone)]
pub struct WorkspaceArena {
    root: PathBuf,
    max_retained: usize,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkspaceArena {
    pub fn new(root: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            root: root.into(),
            max_retained,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a cycle id that sorts chronologically
    pub fn next_cycle_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}-{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"), &uuid[..8])
    }

    /// Create the directory for `cycle_id` and mark it active until dropped
    pub async fn create(&self, cycle_id: &str) -> Result<Workspace> {
        let dir = self.root.join(format!("{}{}", WORKSPACE_PREFIX, cycle_id));
        fs::create_dir_all(&dir).await.map_err(|e| {
            OccucamError::component(
                "workspace",
                &format!("Failed to create {}: {}", dir.display(), e),
            )
        })?;

        self.active
            .lock()
            .map_err(|_| OccucamError::system("Workspace registry poisoned"))?
            .insert(cycle_id.to_string());

        debug!("Created workspace {}", dir.display());
        Ok(Workspace {
            cycle_id: cycle_id.to_string(),
            dir,
            active: Some(Arc::clone(&self.active)),
        })
    }

    /// Number of workspaces currently owned by a cycle or branch
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Remove stale workspaces beyond the retention limit, oldest first
    pub async fn prune(&self) -> PruneReport {
        let mut report = PruneReport::default();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                report
                    .errors
                    .push(format!("Cannot read {}: {}", self.root.display(), e));
                return report;
            }
        };

        let active: HashSet<String> = match self.active.lock() {
            Ok(active) => active.clone(),
            Err(_) => {
                report.errors.push("Workspace registry poisoned".to_string());
                return report;
            }
        };

        let mut stale = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Some(cycle_id) = name.strip_prefix(WORKSPACE_PREFIX) else {
                        continue;
                    };
                    if active.contains(cycle_id) {
                        continue;
                    }
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        stale.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    report.errors.push(format!("Directory scan failed: {}", e));
                    break;
                }
            }
        }

        if stale.len() <= self.max_retained {
            return report;
        }

        // Names embed the creation time, newest sorts last
        stale.sort();
        let excess = stale.len() - self.max_retained;

        for path in stale.into_iter().take(excess) {
            if let Err(e) = self.validate_deletion_safety(&path) {
                report.errors.push(e.to_string());
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!("Pruned stale workspace {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!("Failed to prune workspace {}: {}", path.display(), e);
                    report.errors.push(
                        CleanupError::RemoveDirectory { path, source: e }.to_string(),
                    );
                }
            }
        }

        report
    }

    /// A prunable path must be a direct `cycle-*` child of the root
    fn validate_deletion_safety(&self, path: &Path) -> std::result::Result<(), CleanupError> {
        let unsafe_path = |reason: &str| CleanupError::Unsafe {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| unsafe_path("outside work root"))?;

        if relative.components().count() != 1 {
            return Err(unsafe_path("not a direct child of the work root"));
        }

        let named_like_workspace = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(WORKSPACE_PREFIX) && n.len() > WORKSPACE_PREFIX.len())
            .unwrap_or(false);
        if !named_like_workspace {
            return Err(unsafe_path("not a workspace directory"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_paths() {
        let workspace = Workspace::new("c1", "/tmp/work/cycle-c1");
        let image = workspace.image_path("IMG01.JPG");

        assert_eq!(image, PathBuf::from("/tmp/work/cycle-c1/IMG01.JPG"));
        assert_eq!(
            workspace.label_path(&image),
            PathBuf::from("/tmp/work/cycle-c1/runs/detect/exp/labels/IMG01.txt")
        );
        assert_eq!(
            workspace.annotated_image(&image),
            PathBuf::from("/tmp/work/cycle-c1/runs/detect/exp/IMG01.JPG")
        );
        assert_eq!(
            workspace.redacted_output("7_x.JPG").unwrap(),
            PathBuf::from("/tmp/work/cycle-c1/runs/detect/exp/7_x.JPG")
        );
    }

    #[test]
    fn test_redacted_output_stays_in_workspace() {
        let workspace = Workspace::new("c1", "/tmp/work/cycle-c1");
        for name in ["../../../../escaped.JPG", "floor2/room7_x.JPG", "..", "", "/abs.JPG"] {
            assert!(
                matches!(
                    workspace.redacted_output(name),
                    Err(RedactionError::InvalidOutputName { .. })
                ),
                "{:?} should be refused",
                name
            );
        }
    }

    #[test]
    fn test_cycle_ids_are_unique() {
        let a = WorkspaceArena::next_cycle_id();
        let b = WorkspaceArena::next_cycle_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_active_tracking() {
        let root = tempfile::tempdir().unwrap();
        let arena = WorkspaceArena::new(root.path(), 1);

        let workspace = arena.create("a").await.unwrap();
        assert!(workspace.dir().is_dir());
        assert_eq!(arena.active_count(), 1);

        drop(workspace);
        assert_eq!(arena.active_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_skips_active() {
        let root = tempfile::tempdir().unwrap();
        let arena = WorkspaceArena::new(root.path(), 2);

        for id in [
            "20240101_000000_000-aaaa",
            "20240102_000000_000-bbbb",
            "20240103_000000_000-cccc",
            "20240104_000000_000-dddd",
        ] {
            std::fs::create_dir_all(root.path().join(format!("cycle-{}", id))).unwrap();
        }
        std::fs::create_dir_all(root.path().join("unrelated")).unwrap();

        // Oldest directory belongs to a running cycle
        let active = arena.create("20240101_000000_000-aaaa").await.unwrap();

        let report = arena.prune().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.removed.len(), 1);
        assert!(active.dir().exists());
        assert!(!root.path().join("cycle-20240102_000000_000-bbbb").exists());
        assert!(root.path().join("cycle-20240103_000000_000-cccc").exists());
        assert!(root.path().join("cycle-20240104_000000_000-dddd").exists());
        assert!(root.path().join("unrelated").exists());
    }

    #[tokio::test]
    async fn test_prune_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let arena = WorkspaceArena::new(root.path().join("missing"), 0);
        let report = arena.prune().await;
        assert!(report.removed.is_empty());
        assert!(report.errors.is_empty());
    }
}
