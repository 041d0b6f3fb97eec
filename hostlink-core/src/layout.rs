use std::path::{Path, PathBuf};

pub const DEFAULT_PROJECT_MARKER: &str = "Assets";
pub const DATA_DIR_NAME: &str = ".hostlink";
pub const DATABASE_FILE: &str = "coordination.db";
pub const SIDE_CHANNEL_FILE: &str = "side_channel.jsonl";

/// Where a project's coordination state lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    project_root: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("no directory containing '{marker}' found above {start}")]
    ProjectNotFound { marker: String, start: PathBuf },

    #[error("invalid path '{input}'")]
    InvalidPath { input: String },
}

impl ProjectLayout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Walk up from `start` until a directory holding `marker` is found.
    pub fn discover(start: &Path, marker: &str) -> Result<Self, LayoutError> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(marker).is_dir() {
                return Ok(Self::new(dir));
            }
            current = dir.parent();
        }
        Err(LayoutError::ProjectNotFound {
            marker: marker.to_string(),
            start: start.to_path_buf(),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.project_root.join(DATA_DIR_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE)
    }

    pub fn side_channel_path(&self) -> PathBuf {
        self.data_dir().join(SIDE_CHANNEL_FILE)
    }
}

/// Resolve a configured path: `~` expands to `home_dir`, relative paths are
/// taken against `base_dir`.
pub fn resolve_path(raw: &str, base_dir: &Path, home_dir: Option<&Path>) -> Result<PathBuf, LayoutError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LayoutError::InvalidPath {
            input: raw.to_string(),
        });
    }

    if let Some(home) = home_dir {
        if let Some(rest) = trimmed.strip_prefix("~/") {
            return Ok(home.join(rest));
        }
        if trimmed == "~" {
            return Ok(home.to_path_buf());
        }
    }

    let path = PathBuf::from(trimmed);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(base_dir.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_paths_are_stable() {
        let layout = ProjectLayout::new("/work/game");
        assert_eq!(layout.data_dir(), PathBuf::from("/work/game/.hostlink"));
        assert_eq!(
            layout.database_path(),
            PathBuf::from("/work/game/.hostlink/coordination.db")
        );
        assert_eq!(
            layout.side_channel_path(),
            PathBuf::from("/work/game/.hostlink/side_channel.jsonl")
        );
    }

    #[test]
    fn discover_walks_up_to_marker() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("Assets/Scripts/Deep")).expect("mkdir");
        let start = root.path().join("Assets/Scripts/Deep");
        let layout = ProjectLayout::discover(&start, DEFAULT_PROJECT_MARKER).expect("found");
        assert_eq!(layout.project_root(), root.path());
    }

    #[test]
    fn discover_fails_without_marker() {
        let root = tempfile::tempdir().expect("tempdir");
        let err = ProjectLayout::discover(root.path(), "NoSuchMarkerDir_hostlink").unwrap_err();
        assert!(matches!(err, LayoutError::ProjectNotFound { .. }));
    }

    #[test]
    fn resolve_path_expands_tilde_and_relative() {
        let home = Path::new("/home/test");
        assert_eq!(
            resolve_path("~/game", Path::new("/cfg"), Some(home)).expect("resolve"),
            PathBuf::from("/home/test/game")
        );
        assert_eq!(
            resolve_path("game", Path::new("/cfg"), Some(home)).expect("resolve"),
            PathBuf::from("/cfg/game")
        );
        assert_eq!(
            resolve_path("/abs", Path::new("/cfg"), None).expect("resolve"),
            PathBuf::from("/abs")
        );
        assert!(resolve_path("  ", Path::new("/cfg"), None).is_err());
    }
}
