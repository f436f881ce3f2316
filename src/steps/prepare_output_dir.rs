use anyhow::{bail, Context, Result};
use std::fs;

use super::{Step, StepAction, StepContext};

/// Create the output directory, refusing to build over existing output.
pub struct PrepareOutputDir;

impl Step for PrepareOutputDir {
    fn name(&self) -> &'static str {
        "prepare_output_dir"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        let config = ctx.config;
        let dir = config.output_dir();

        if dir.exists() {
            let mut entries = fs::read_dir(dir)
                .with_context(|| format!("Output path {} is not a directory", dir.display()))?;
            if entries.next().is_some() {
                bail!(
                    "Output directory {} already exists and is not empty",
                    dir.display()
                );
            }
            log::debug!("Reusing empty output directory {}", dir.display());
            return Ok(StepAction::Continue);
        }

        ctx.ui
            .say(&format!("Creating output directory: {}", dir.display()));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        ctx.set_created_output_dir(dir.to_path_buf())?;
        Ok(StepAction::Continue)
    }

    fn cleanup(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        if !ctx.halted() {
            return Ok(());
        }
        let Some(dir) = ctx.created_output_dir() else {
            return Ok(());
        };
        if dir.exists() {
            ctx.ui
                .say(&format!("Deleting output directory: {}", dir.display()));
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}
