use anyhow::{Context, Result};

use super::{Step, StepAction, StepContext};

/// Register a new VM. Unregisters and deletes it again if the run halts.
pub struct CreateVm;

impl Step for CreateVm {
    fn name(&self) -> &'static str {
        "create_vm"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        let config = ctx.config;
        ctx.ui.say(&format!(
            "Creating virtual machine {} ({})",
            config.vm_name, config.guest_os_type
        ));
        ctx.driver
            .create_vm(&config.vm_name, &config.guest_os_type)
            .with_context(|| format!("Failed to create VM {}", config.vm_name))?;
        ctx.set_vm(config.vm_name.clone())?;
        Ok(StepAction::Continue)
    }

    fn cleanup(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !ctx.halted() {
            return Ok(());
        }
        let Some(vm) = ctx.vm() else {
            return Ok(());
        };
        ctx.ui.say(&format!("Unregistering and deleting VM {vm}"));
        ctx.driver
            .delete_vm(vm)
            .with_context(|| format!("Failed to delete VM {vm}"))?;
        Ok(())
    }
}
