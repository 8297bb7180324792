//! Background run supervision.
//!
//! Each `start` launches exactly one blocking task per experiment. The
//! supervisor keeps a handle per experiment so a run can be observed,
//! cancelled, or awaited, and so two runs can never overlap on the same
//! directory.

use crate::error::CoreError;
use crate::experiment::Experiment;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Cooperative cancellation flag checked at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct RunHandle {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// Tracks the live background run of each experiment.
#[derive(Default)]
pub struct RunSupervisor {
    runs: Mutex<HashMap<String, RunHandle>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an experiment currently has a live background run.
    pub fn is_running(&self, id: &str) -> bool {
        let runs = self.runs.lock().expect("run table poisoned");
        runs.get(id).is_some_and(|run| !run.handle.is_finished())
    }

    /// Launch the full run (`train → eval(train) → eval(valid) → done`) on a
    /// blocking task. Errors and panics inside the run are recorded through
    /// the experiment's status document instead of dying silently.
    pub fn launch(&self, exp: Experiment) -> Result<(), CoreError> {
        let id = exp.id.clone();
        let mut runs = self.runs.lock().expect("run table poisoned");
        if runs.get(&id).is_some_and(|run| !run.handle.is_finished()) {
            return Err(CoreError::state(format!(
                "experiment {id} is currently running"
            )));
        }

        let cancel = CancelFlag::default();
        let run_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| exp.run(&run_cancel)));
            match outcome {
                Ok(Ok(())) => tracing::info!("[{}] Experiment finished", exp.id),
                Ok(Err(err)) => {
                    tracing::error!("[{}] Experiment failed: {err}", exp.id);
                    record_failure(&exp, &err.to_string());
                }
                Err(_) => {
                    tracing::error!("[{}] Experiment panicked", exp.id);
                    record_failure(&exp, "training run panicked");
                }
            }
        });

        runs.insert(id, RunHandle { cancel, handle });
        Ok(())
    }

    /// Request cancellation of a live run. Returns whether a run was live.
    pub fn cancel(&self, id: &str) -> bool {
        let runs = self.runs.lock().expect("run table poisoned");
        match runs.get(id) {
            Some(run) if !run.handle.is_finished() => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for an experiment's run to finish, if one was launched.
    pub async fn wait(&self, id: &str) {
        let run = {
            let mut runs = self.runs.lock().expect("run table poisoned");
            runs.remove(id)
        };
        if let Some(run) = run {
            let _ = run.handle.await;
        }
    }
}

fn record_failure(exp: &Experiment, message: &str) {
    if let Err(err) = exp.status.mark_failed(message) {
        tracing::error!("[{}] Could not record failure: {err}", exp.id);
    }
}
