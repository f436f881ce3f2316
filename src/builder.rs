//! Orchestration surface: prepare a build, run it, cancel it.

use crate::artifact::Artifact;
use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::driver::{locate_vboxmanage, new_driver, Driver, DriverError};
use crate::error::{BuildError, ConfigError, ConfigErrors};
use crate::steps::{default_steps, run_steps, RunOutcome, StepContext};
use crate::ui::{Hook, Ui};

/// Constructs the driver during `prepare`. Receives the builder's token so
/// driver commands can be killed on cancellation.
pub type DriverFactory =
    Box<dyn Fn(&CancelToken) -> Result<Box<dyn Driver>, DriverError> + Send + Sync>;

pub struct Builder {
    config: Option<BuildConfig>,
    driver: Option<Box<dyn Driver>>,
    driver_factory: DriverFactory,
    cancel: CancelToken,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// A builder whose driver talks to the installed `VBoxManage`.
    ///
    /// The binary is located once, during `prepare`, and handed to the driver.
    pub fn new() -> Self {
        Self::with_driver_factory(Box::new(
            |cancel: &CancelToken| -> Result<Box<dyn Driver>, DriverError> {
                let vboxmanage = locate_vboxmanage()?;
                new_driver(vboxmanage, cancel.clone())
            },
        ))
    }

    pub fn with_driver_factory(driver_factory: DriverFactory) -> Self {
        Self {
            config: None,
            driver: None,
            driver_factory,
            cancel: CancelToken::new(),
        }
    }

    /// Validate `raw` and construct the driver.
    ///
    /// Spec defects and a driver failure are reported together.
    pub fn prepare(&mut self, raw: &serde_json::Value) -> Result<(), BuildError> {
        let mut errs = Vec::new();

        let config = match BuildConfig::from_raw(raw) {
            Ok(config) => Some(config),
            Err(ConfigErrors(found)) => {
                errs.extend(found);
                None
            }
        };

        let driver = match (self.driver_factory)(&self.cancel) {
            Ok(driver) => Some(driver),
            Err(err) => {
                errs.push(ConfigError::DriverUnavailable(err));
                None
            }
        };

        if !errs.is_empty() {
            return Err(BuildError::Configuration(ConfigErrors(errs)));
        }

        if let Some(config) = &config {
            log::debug!("Prepared build config: {:?}", config);
        }
        self.config = config;
        self.driver = driver;
        Ok(())
    }

    pub fn config(&self) -> Option<&BuildConfig> {
        self.config.as_ref()
    }

    /// Run every step against a fresh context.
    ///
    /// Returns `Ok(None)` when the run was cancelled. A cancel request made
    /// while no run is in progress does not carry over into the next run.
    pub fn run(
        &self,
        ui: &dyn Ui,
        hook: &dyn Hook,
        cache: &dyn Cache,
    ) -> Result<Option<Artifact>, BuildError> {
        let (Some(config), Some(driver)) = (self.config.as_ref(), self.driver.as_deref()) else {
            return Err(BuildError::NotPrepared);
        };
        self.cancel.reset();

        let steps = default_steps();
        let mut ctx = StepContext::new(config, driver, cache, ui, hook, &self.cancel);

        match run_steps(&steps, &mut ctx) {
            RunOutcome::Completed => Ok(Some(Artifact::new(
                config.output_dir(),
                config.vm_name.clone(),
            ))),
            RunOutcome::Cancelled => {
                ui.error("Build was cancelled.");
                Ok(None)
            }
            RunOutcome::Failed { step, error } => {
                log::error!("Step {} failed: {:#}", step, error);
                Err(BuildError::StepFailed { step, source: error })
            }
        }
    }

    /// Request cancellation of the current run. Idempotent.
    pub fn cancel(&self) {
        log::info!("Cancelling the step runner...");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
