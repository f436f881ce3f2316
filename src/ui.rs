//! Progress sink and post-step hook seams.

use anyhow::Result;

use crate::config::BuildConfig;

/// Hook name invoked after every step that continues the pipeline.
pub const HOOK_POST_STEP: &str = "post_step";

/// Receives textual status and error events from a build.
pub trait Ui: Send + Sync {
    /// A headline status line.
    fn say(&self, message: &str);

    /// Detail beneath the last headline.
    fn message(&self, message: &str);

    fn error(&self, message: &str);
}

/// Prints to the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("==> {}", message);
    }

    fn message(&self, message: &str) {
        println!("    {}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("==> {}", message);
    }
}

/// Data handed to a hook.
#[derive(Debug, Clone, Copy)]
pub struct HookData<'a> {
    /// Step that just finished.
    pub step: &'a str,
    pub config: &'a BuildConfig,
}

/// Called at lifecycle points between steps.
pub trait Hook: Send + Sync {
    fn run(&self, name: &str, ui: &dyn Ui, data: &HookData<'_>) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn run(&self, _name: &str, _ui: &dyn Ui, _data: &HookData<'_>) -> Result<()> {
        Ok(())
    }
}
