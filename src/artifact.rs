//! Descriptor for a finished build.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Identifies artifacts produced by this builder.
pub const BUILDER_ID: &str = "vbox-builder.virtualbox";

/// A VM image in `output_dir`, registered under `vm_name`.
///
/// The layout below `output_dir` belongs to VirtualBox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub output_dir: PathBuf,
    pub vm_name: String,
}

impl Artifact {
    pub fn new(output_dir: impl Into<PathBuf>, vm_name: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            vm_name: vm_name.into(),
        }
    }

    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    pub fn id(&self) -> &str {
        &self.vm_name
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Every regular file under the output directory, sorted.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.output_dir).sort_by_file_name() {
            let entry = entry.with_context(|| {
                format!("Failed to walk {}", self.output_dir.display())
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Remove the output directory and everything in it.
    pub fn destroy(&self) -> Result<()> {
        if !self.output_dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to remove {}", self.output_dir.display()))
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VM files in directory: {} (VM: {})",
            self.output_dir.display(),
            self.vm_name
        )
    }
}
