use anyhow::{Context, Result};

use super::{Step, StepAction, StepContext};

/// Turn off VirtualBox notices that would wait for a click.
pub struct SuppressMessages;

impl Step for SuppressMessages {
    fn name(&self) -> &'static str {
        "suppress_messages"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        log::debug!("Suppressing VirtualBox GUI messages");
        ctx.driver
            .suppress_messages()
            .context("Failed to suppress VirtualBox messages")?;
        Ok(StepAction::Continue)
    }
}
