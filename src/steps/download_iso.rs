//! Resolve the installation medium to a local, verified file.

use anyhow::{Context, Result};

use crate::config::IsoSource;
use crate::download::{fetch_iso, Fetched, IsoRequest};

use super::{Step, StepAction, StepContext};

pub struct DownloadIso;

impl Step for DownloadIso {
    fn name(&self) -> &'static str {
        "download_iso"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepAction> {
        let config = ctx.config;
        match config.iso_source()? {
            IsoSource::Local(path) => {
                ctx.ui.say(&format!("Using local ISO: {}", path.display()));
                ctx.ui.message(&format!(
                    "Local media is used in place; its {} checksum is not verified",
                    config.iso_checksum_type
                ));
                log::warn!(
                    "Skipping checksum verification for local ISO {}",
                    path.display()
                );
                ctx.set_iso_path(path)?;
                Ok(StepAction::Continue)
            }
            IsoSource::Remote(url) => {
                ctx.ui.say(&format!("Retrieving ISO from {url}"));
                let request = IsoRequest {
                    url: &config.iso_url,
                    checksum_type: config.iso_checksum_type,
                    checksum: &config.iso_checksum,
                };
                let fetched = fetch_iso(request, ctx.cache, ctx.ui, ctx.cancel)
                    .with_context(|| format!("Failed to retrieve {}", config.iso_url))?;
                match fetched {
                    Fetched::Ready(path) => {
                        ctx.ui.message(&format!("ISO ready: {}", path.display()));
                        ctx.set_iso_path(path)?;
                        Ok(StepAction::Continue)
                    }
                    Fetched::Cancelled => {
                        ctx.ui.error("ISO download cancelled");
                        Ok(StepAction::Halt)
                    }
                }
            }
        }
    }
}
