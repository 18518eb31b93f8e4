//! Job workspaces on disk: `<projects_dir>/<owner>/<id>-<safe_name>`.
//!
//! A submitted `.zip` is unpacked into the workspace and the entry script is
//! looked up inside it. Anything else is written as-is and is the entry.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use crate::config::SupervisorConfig;
use crate::store::{JobId, OwnerId};

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("invalid file name '{0}'")]
    InvalidFilename(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("no runnable entry found in archive (looked for {0})")]
    NoEntry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    entry_candidates: Vec<String>,
    script_extension: String,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, cfg: &SupervisorConfig) -> Self {
        Self {
            root: root.into(),
            entry_candidates: cfg.entry_candidates.clone(),
            script_extension: cfg.script_extension.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner_dir(&self, owner: OwnerId) -> PathBuf {
        self.root.join(owner.to_string())
    }

    pub fn job_dir(&self, owner: OwnerId, id: JobId, safe_name: &str) -> PathBuf {
        self.owner_dir(owner).join(format!("{}-{}", id, safe_name))
    }

    /// Replace the contents of `dir` with the submitted file and return the
    /// absolute path of the entry script.
    pub fn place(&self, dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "..")
            .ok_or_else(|| WorkspaceError::InvalidFilename(filename.to_string()))?;

        clear_dir(dir)?;
        fs::create_dir_all(dir)?;
        let dir = fs::canonicalize(dir)?;

        if has_extension(Path::new(name), "zip") {
            let mut archive = ZipArchive::new(Cursor::new(bytes))?;
            archive.extract(&dir)?;
            let entry = self.find_entry(&dir)?;
            tracing::info!("Unpacked {} into {} (entry {})", name, dir.display(), entry.display());
            Ok(entry)
        } else {
            let path = dir.join(name);
            fs::write(&path, bytes)?;
            tracing::info!("Placed {} ({} bytes)", path.display(), bytes.len());
            Ok(path)
        }
    }

    /// First configured candidate at the top level, else the shallowest file
    /// with the script extension.
    fn find_entry(&self, dir: &Path) -> Result<PathBuf, WorkspaceError> {
        for candidate in &self.entry_candidates {
            let path = dir.join(candidate);
            if path.is_file() {
                return Ok(path);
            }
        }

        let mut scripts = Vec::new();
        collect_files(dir, 0, &mut scripts)?;
        scripts.retain(|(_, p)| has_extension(p, &self.script_extension));
        scripts.sort();
        scripts.into_iter().next().map(|(_, p)| p).ok_or_else(|| {
            WorkspaceError::NoEntry(format!(
                "{} or any *.{}",
                self.entry_candidates.join(", "),
                self.script_extension
            ))
        })
    }

    pub fn remove_job_dir(&self, dir: &Path) -> Result<(), WorkspaceError> {
        clear_dir(dir)
    }

    pub fn remove_owner(&self, owner: OwnerId) -> Result<(), WorkspaceError> {
        clear_dir(&self.owner_dir(owner))
    }
}

fn clear_dir(dir: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<(usize, PathBuf)>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, depth + 1, out)?;
        } else if path.is_file() {
            out.push((depth, path));
        }
    }
    Ok(())
}
