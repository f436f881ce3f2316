use anyhow::{Context, Result};

use super::{Step, StepAction, StepContext};

/// Insert the installation medium into the VM's DVD drive.
///
/// The medium is always ejected on cleanup so the finished VM never points
/// at a file inside the download cache.
pub struct AttachIso;

impl Step for AttachIso {
    fn name(&self) -> &'static str {
        "attach_iso"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        let vm = ctx
            .vm()
            .context("attach_iso needs a VM; create_vm has not run")?
            .to_string();
        let iso = ctx
            .iso_path()
            .context("attach_iso needs an ISO; download_iso has not run")?
            .to_path_buf();

        ctx.ui.say(&format!("Attaching ISO: {}", iso.display()));
        ctx.driver
            .attach_medium(&vm, &iso)
            .with_context(|| format!("Failed to attach {} to {vm}", iso.display()))?;
        ctx.set_iso_attached()?;
        Ok(StepAction::Continue)
    }

    fn cleanup(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !ctx.iso_attached() {
            return Ok(());
        }
        let Some(vm) = ctx.vm() else {
            return Ok(());
        };
        log::debug!("Detaching ISO from {vm}");
        ctx.driver
            .detach_medium(vm)
            .with_context(|| format!("Failed to detach ISO from {vm}"))?;
        Ok(())
    }
}
