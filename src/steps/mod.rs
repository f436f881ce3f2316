//! Provisioning steps and the typed context threaded through them.
//!
//! Steps run strictly in order against one [`StepContext`]. Values a step
//! produces for later steps are write-once fields: a second write is an
//! error rather than a silent overwrite.

pub mod attach_iso;
pub mod create_disk;
pub mod create_vm;
pub mod download_iso;
pub mod prepare_output_dir;
pub mod runner;
pub mod suppress_messages;

use anyhow::{bail, Result};
use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::driver::Driver;
use crate::ui::{Hook, Ui};

pub use attach_iso::AttachIso;
pub use create_disk::CreateDisk;
pub use create_vm::CreateVm;
pub use download_iso::DownloadIso;
pub use prepare_output_dir::PrepareOutputDir;
pub use runner::{run_steps, RunOutcome};
pub use suppress_messages::SuppressMessages;

/// What the runner should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Stop scheduling further steps. Used when a step observed cancellation.
    Halt,
}

/// A single provisioning operation.
///
/// Steps hold no per-run state; anything a cleanup needs is read back from
/// the context.
pub trait Step: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction>;

    /// Undo or release what `run` acquired. Runs for every step that ran, in
    /// reverse order, whether the build succeeded, failed or was cancelled.
    fn cleanup(&self, _ctx: &mut StepContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// The standard pipeline, in execution order.
pub fn default_steps() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(DownloadIso),
        Box::new(PrepareOutputDir),
        Box::new(SuppressMessages),
        Box::new(CreateVm),
        Box::new(CreateDisk),
        Box::new(AttachIso),
    ]
}

/// Shared state for one run of the pipeline.
pub struct StepContext<'a> {
    pub config: &'a BuildConfig,
    pub driver: &'a dyn Driver,
    pub cache: &'a dyn Cache,
    pub ui: &'a dyn Ui,
    pub hook: &'a dyn Hook,
    pub cancel: &'a CancelToken,
    halted: bool,
    iso_path: OnceCell<PathBuf>,
    created_output_dir: OnceCell<PathBuf>,
    vm: OnceCell<String>,
    disk_path: OnceCell<PathBuf>,
    disk_attached: OnceCell<()>,
    iso_attached: OnceCell<()>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        config: &'a BuildConfig,
        driver: &'a dyn Driver,
        cache: &'a dyn Cache,
        ui: &'a dyn Ui,
        hook: &'a dyn Hook,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            config,
            driver,
            cache,
            ui,
            hook,
            cancel,
            halted: false,
            iso_path: OnceCell::new(),
            created_output_dir: OnceCell::new(),
            vm: OnceCell::new(),
            disk_path: OnceCell::new(),
            disk_attached: OnceCell::new(),
            iso_attached: OnceCell::new(),
        }
    }

    /// True once the pipeline stopped early, by failure or cancellation.
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub(crate) fn mark_halted(&mut self) {
        self.halted = true;
    }

    /// Local, verified installation medium.
    pub fn iso_path(&self) -> Option<&Path> {
        self.iso_path.get().map(PathBuf::as_path)
    }

    pub fn set_iso_path(&mut self, path: PathBuf) -> Result<()> {
        set_once(&self.iso_path, path, "iso_path")
    }

    /// Output directory, if this run created it.
    pub fn created_output_dir(&self) -> Option<&Path> {
        self.created_output_dir.get().map(PathBuf::as_path)
    }

    pub fn set_created_output_dir(&mut self, path: PathBuf) -> Result<()> {
        set_once(&self.created_output_dir, path, "created_output_dir")
    }

    /// Name of the VM registered by this run.
    pub fn vm(&self) -> Option<&str> {
        self.vm.get().map(String::as_str)
    }

    pub fn set_vm(&mut self, name: String) -> Result<()> {
        set_once(&self.vm, name, "vm")
    }

    /// Disk image created by this run, attached or not.
    pub fn disk_path(&self) -> Option<&Path> {
        self.disk_path.get().map(PathBuf::as_path)
    }

    pub fn set_disk_path(&mut self, path: PathBuf) -> Result<()> {
        set_once(&self.disk_path, path, "disk_path")
    }

    /// True once the disk hangs off the VM and goes away with it.
    pub fn disk_attached(&self) -> bool {
        self.disk_attached.get().is_some()
    }

    pub fn set_disk_attached(&mut self) -> Result<()> {
        set_once(&self.disk_attached, (), "disk_attached")
    }

    pub fn iso_attached(&self) -> bool {
        self.iso_attached.get().is_some()
    }

    pub fn set_iso_attached(&mut self) -> Result<()> {
        set_once(&self.iso_attached, (), "iso_attached")
    }
}

fn set_once<T>(cell: &OnceCell<T>, value: T, key: &str) -> Result<()> {
    if cell.set(value).is_err() {
        bail!("context value '{key}' was already written by an earlier step");
    }
    Ok(())
}
