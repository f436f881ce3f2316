use anyhow::{Context, Result};
use std::env;

use super::{Step, StepAction, StepContext};

/// Create the primary disk and attach it to the VM.
///
/// An attached disk is deleted together with its VM. A disk that was created
/// but never attached is closed and deleted here if the run halts.
pub struct CreateDisk;

impl Step for CreateDisk {
    fn name(&self) -> &'static str {
        "create_disk"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        let config = ctx.config;
        let vm = ctx
            .vm()
            .context("create_disk needs a VM; create_vm has not run")?
            .to_string();

        // VBoxManage resolves relative medium paths against its own home.
        let mut path = config.disk_path();
        if path.is_relative() {
            path = env::current_dir()
                .context("Failed to read current directory")?
                .join(path);
        }

        ctx.ui.say(&format!(
            "Creating {} MB disk: {}",
            config.disk_size,
            path.display()
        ));
        ctx.driver
            .create_disk(&path, config.disk_size)
            .with_context(|| format!("Failed to create disk {}", path.display()))?;
        ctx.set_disk_path(path.clone())?;
        ctx.driver
            .attach_disk(&vm, &path)
            .with_context(|| format!("Failed to attach disk to {vm}"))?;
        ctx.set_disk_attached()?;
        Ok(StepAction::Continue)
    }

    fn cleanup(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !ctx.halted() || ctx.disk_attached() {
            return Ok(());
        }
        let Some(path) = ctx.disk_path() else {
            return Ok(());
        };
        ctx.ui.say(&format!("Deleting unattached disk {}", path.display()));
        ctx.driver
            .delete_disk(path)
            .with_context(|| format!("Failed to delete disk {}", path.display()))?;
        Ok(())
    }
}
