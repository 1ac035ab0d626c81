//! Source directory access.
//!
//! [`SourceDirectory`] is the pipeline's view of raw source files: an
//! enumerable listing plus byte access by relative filename.
//! [`FsSourceDirectory`] walks a local directory with include/exclude globs;
//! `.git`, `target` and `node_modules` are always excluded.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use corpus_harness_core::models::SourceFile;

use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult};

/// Read-only access to the source documents.
pub trait SourceDirectory: Send + Sync {
    /// Every tracked file, sorted by filename.
    fn list(&self) -> Result<Vec<SourceFile>>;

    /// Contents of `filename`, or `None` if it does not exist or is not
    /// tracked by this directory.
    fn read(&self, filename: &str) -> Result<Option<Vec<u8>>>;
}

/// Reject empty, absolute, or parent-escaping filenames before any state is
/// touched.
pub fn validate_filename(filename: &str) -> PipelineResult<()> {
    if filename.trim().is_empty() {
        return Err(PipelineError::Input("filename must not be empty".into()));
    }
    let path = Path::new(filename);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || filename.starts_with('/') || filename.starts_with('\\') {
        return Err(PipelineError::Input(format!(
            "filename must be relative to the source root: '{}'",
            filename
        )));
    }
    Ok(())
}

pub struct FsSourceDirectory {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsSourceDirectory {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn is_tracked(&self, rel: &str) -> bool {
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }
}

impl SourceDirectory for FsSourceDirectory {
    fn list(&self) -> Result<Vec<SourceFile>> {
        if !self.root.is_dir() {
            bail!("Source root does not exist: {}", self.root.display());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel = to_slash(relative);
            if !self.is_tracked(&rel) {
                continue;
            }

            let metadata = entry.metadata()?;
            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            files.push(SourceFile {
                filename: rel,
                size: metadata.len(),
                modified_at,
            });
        }

        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        if !self.is_tracked(filename) {
            return Ok(None);
        }
        let path = self.root.join(filename);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source(root: &Path) -> FsSourceDirectory {
        FsSourceDirectory::new(&SourceConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".into(), "**/*.pdf".into()],
            exclude_globs: vec!["**/drafts/**".into()],
            follow_symlinks: false,
        })
        .unwrap()
    }

    #[test]
    fn test_list_applies_globs_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("nested/a.pdf"), "pdf").unwrap();
        fs::write(root.join("notes.bin"), "x").unwrap();
        fs::write(root.join("drafts/wip.md"), "x").unwrap();
        fs::write(root.join(".git/HEAD.md"), "x").unwrap();

        let names: Vec<String> = source(root)
            .list()
            .unwrap()
            .into_iter()
            .map(|f| f.filename)
            .collect();
        assert_eq!(names, vec!["b.md", "nested/a.pdf"]);
    }

    #[test]
    fn test_read_missing_and_untracked() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "hello").unwrap();
        fs::write(tmp.path().join("a.bin"), "hello").unwrap();
        let dir = source(tmp.path());

        assert_eq!(dir.read("a.md").unwrap().unwrap(), b"hello");
        assert!(dir.read("missing.md").unwrap().is_none());
        assert!(dir.read("a.bin").unwrap().is_none());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(source(&tmp.path().join("nope")).list().is_err());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("decks/q3.pptx").is_ok());
        assert!(matches!(
            validate_filename(""),
            Err(PipelineError::Input(_))
        ));
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("/abs/path.pdf").is_err());
        assert!(validate_filename("a/../../b.pdf").is_err());
    }
}
