//! Sequential step execution with reverse-order cleanup.

use crate::ui::{HookData, HOOK_POST_STEP};

use super::{Step, StepAction, StepContext};

/// How a pipeline run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// `step` is the failing step's name, or `hook:<step>` for a hook failure.
    Failed { step: String, error: anyhow::Error },
}

/// Run `steps` in order against `ctx`, then unwind.
///
/// Cancellation is checked before each step. A step that fails while the
/// token is set is reported as cancelled, since the failure is usually the
/// killed external command. Cleanups run for every step that ran, last
/// first, on every exit path; their errors are reported but never replace
/// the outcome.
pub fn run_steps(steps: &[Box<dyn Step>], ctx: &mut StepContext<'_>) -> RunOutcome {
    let mut ran: Vec<&dyn Step> = Vec::with_capacity(steps.len());
    let mut outcome = RunOutcome::Completed;

    for step in steps {
        if ctx.cancel.is_cancelled() {
            log::info!("Cancelled before step {}", step.name());
            outcome = RunOutcome::Cancelled;
            break;
        }

        log::debug!("Running step {}", step.name());
        ran.push(step.as_ref());
        match step.run(ctx) {
            Ok(StepAction::Continue) => {}
            Ok(StepAction::Halt) => {
                log::info!("Step {} halted the pipeline", step.name());
                outcome = RunOutcome::Cancelled;
                break;
            }
            Err(error) if ctx.cancel.is_cancelled() => {
                log::info!("Step {} stopped by cancellation: {:#}", step.name(), error);
                outcome = RunOutcome::Cancelled;
                break;
            }
            Err(error) => {
                outcome = RunOutcome::Failed {
                    step: step.name().to_string(),
                    error,
                };
                break;
            }
        }

        let data = HookData {
            step: step.name(),
            config: ctx.config,
        };
        if let Err(error) = ctx.hook.run(HOOK_POST_STEP, ctx.ui, &data) {
            outcome = RunOutcome::Failed {
                step: format!("hook:{}", step.name()),
                error,
            };
            break;
        }
    }

    if !matches!(outcome, RunOutcome::Completed) {
        ctx.mark_halted();
    }

    for step in ran.iter().rev() {
        if let Err(err) = step.cleanup(ctx) {
            log::warn!("Cleanup for step {} failed: {:#}", step.name(), err);
            ctx.ui.error(&format!("Cleanup of {} failed: {:#}", step.name(), err));
        }
    }

    outcome
}
