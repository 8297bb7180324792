//! Experiment lifecycle state machine, persisted as `status.yaml`.
//!
//! Legal transitions: `create → train → eval → done`, with `failed` reachable
//! from any non-terminal state. Every operation is a read-modify-write of the
//! whole document; the design assumes at most one active writer per
//! experiment.

use crate::error::CoreError;
use crate::metrics::EvalReport;
use crate::persist;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const STATUS_FILE: &str = "status.yaml";

/// Timestamp format shared by the status document and the HTTP envelope.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Current timestamp rendered in the document format.
pub fn now_string() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Lifecycle state of an experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Create,
    Train,
    Eval,
    Done,
    Failed,
}

impl RunState {
    /// States from which a (re-)start is allowed.
    pub fn is_startable(self) -> bool {
        matches!(self, Self::Create | Self::Done | Self::Failed)
    }

    /// States in which deleting the experiment is allowed.
    pub fn is_deletable(self) -> bool {
        matches!(self, Self::Create | Self::Done | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The `run` section: state, timestamps, and training progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub status: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Run duration in seconds; present iff `end` is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curr_epoch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final metrics, present iff the run reached `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResults {
    pub train: EvalReport,
    pub valid: EvalReport,
}

/// The whole persisted status document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub run: RunInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SplitResults>,
}

/// Owns the status document of one experiment directory.
pub struct StatusManager {
    path: PathBuf,
}

impl StatusManager {
    pub fn new(exp_dir: &Path) -> Self {
        Self {
            path: exp_dir.join(STATUS_FILE),
        }
    }

    /// Read the whole document.
    pub fn read(&self) -> Result<StatusDocument, CoreError> {
        persist::load_yaml(&self.path)?.ok_or_else(|| {
            CoreError::not_found(format!("status document {}", self.path.display()))
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<RunState, CoreError> {
        Ok(self.read()?.run.status)
    }

    fn write(&self, document: &StatusDocument) -> Result<(), CoreError> {
        persist::atomic_write_yaml(&self.path, document)?;
        Ok(())
    }

    /// Initialize the document for a freshly created experiment.
    pub fn create(&self) -> Result<(), CoreError> {
        let document = StatusDocument {
            run: RunInfo {
                status: RunState::Create,
                create: Some(now_string()),
                start: None,
                end: None,
                dur: None,
                curr_epoch: None,
                best_loss: None,
                error: None,
            },
            result: None,
        };
        self.write(&document)
    }

    /// Transition into `train`. Allowed from `create` and from the terminal
    /// states (a finished experiment may be re-run); clears the previous
    /// run's progress, timestamps, and results.
    pub fn mark_train_start(&self) -> Result<(), CoreError> {
        let mut document = self.read()?;
        if !document.run.status.is_startable() {
            return Err(CoreError::state(format!(
                "cannot start training from status {}",
                document.run.status
            )));
        }
        document.run.status = RunState::Train;
        document.run.start = Some(now_string());
        document.run.end = None;
        document.run.dur = None;
        document.run.curr_epoch = None;
        document.run.best_loss = None;
        document.run.error = None;
        document.result = None;
        self.write(&document)
    }

    /// Record the current epoch and running best loss.
    pub fn update_progress(&self, epoch: usize, best_loss: f64) -> Result<(), CoreError> {
        let mut document = self.read()?;
        if document.run.status != RunState::Train {
            return Err(CoreError::state(format!(
                "cannot record progress in status {}",
                document.run.status
            )));
        }
        document.run.curr_epoch = Some(epoch);
        document.run.best_loss = Some(best_loss);
        self.write(&document)
    }

    /// Transition `train → eval`, stamping the end time and duration.
    pub fn mark_eval_start(&self) -> Result<(), CoreError> {
        let mut document = self.read()?;
        if document.run.status != RunState::Train {
            return Err(CoreError::state(format!(
                "cannot start evaluation from status {}",
                document.run.status
            )));
        }
        let end = now_string();
        let start = document
            .run
            .start
            .as_deref()
            .ok_or_else(|| CoreError::state("training end reached without a start timestamp"))?;
        document.run.dur = Some(duration_seconds(start, &end)?);
        document.run.end = Some(end);
        document.run.status = RunState::Eval;
        self.write(&document)
    }

    /// Transition `eval → done`, attaching the final metrics.
    pub fn mark_done(&self, train: EvalReport, valid: EvalReport) -> Result<(), CoreError> {
        let mut document = self.read()?;
        if document.run.status != RunState::Eval {
            return Err(CoreError::state(format!(
                "cannot finish from status {}",
                document.run.status
            )));
        }
        document.run.status = RunState::Done;
        document.result = Some(SplitResults { train, valid });
        self.write(&document)
    }

    /// Transition into the `failed` terminal state with a recorded error.
    pub fn mark_failed(&self, message: &str) -> Result<(), CoreError> {
        let mut document = self.read()?;
        if document.run.status.is_terminal() {
            return Err(CoreError::state(format!(
                "cannot fail from terminal status {}",
                document.run.status
            )));
        }
        if document.run.end.is_none()
            && let Some(start) = document.run.start.clone()
        {
            let end = now_string();
            document.run.dur = Some(duration_seconds(&start, &end)?);
            document.run.end = Some(end);
        }
        document.run.status = RunState::Failed;
        document.run.error = Some(message.to_string());
        self.write(&document)
    }
}

fn duration_seconds(start: &str, end: &str) -> Result<f64, CoreError> {
    let parse = |value: &str| {
        NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
            .map_err(|e| CoreError::state(format!("unparseable timestamp {value:?}: {e}")))
    };
    let elapsed = parse(end)? - parse(start)?;
    Ok(elapsed.num_microseconds().unwrap_or_default() as f64 / 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::classification_report;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn report() -> EvalReport {
        classification_report(&[0, 1], &[0, 1], 2)
    }

    fn manager() -> (TempDir, StatusManager) {
        let dir = TempDir::new().unwrap();
        let manager = StatusManager::new(dir.path());
        manager.create().unwrap();
        (dir, manager)
    }

    #[test]
    fn test_create_initializes_document() {
        let (_dir, manager) = manager();
        let document = manager.read().unwrap();
        assert_eq!(document.run.status, RunState::Create);
        assert!(document.run.create.is_some());
        assert!(document.run.start.is_none());
        assert!(document.result.is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let (_dir, manager) = manager();
        manager.mark_train_start().unwrap();
        manager.update_progress(1, 999.0).unwrap();
        manager.mark_eval_start().unwrap();
        manager.mark_done(report(), report()).unwrap();

        let document = manager.read().unwrap();
        assert_eq!(document.run.status, RunState::Done);
        assert_eq!(document.run.curr_epoch, Some(1));
        assert!(document.result.is_some());
    }

    #[test]
    fn test_done_unreachable_from_create() {
        let (_dir, manager) = manager();
        let err = manager.mark_done(report(), report()).unwrap_err();
        assert!(matches!(err, CoreError::State(_)));
    }

    #[test]
    fn test_eval_unreachable_without_train() {
        let (_dir, manager) = manager();
        assert!(manager.mark_eval_start().is_err());
    }

    #[test]
    fn test_progress_requires_train() {
        let (_dir, manager) = manager();
        assert!(manager.update_progress(1, 1.0).is_err());
    }

    #[test]
    fn test_dur_present_iff_end_present() {
        let (_dir, manager) = manager();
        manager.mark_train_start().unwrap();

        let mid = manager.read().unwrap();
        assert!(mid.run.end.is_none());
        assert!(mid.run.dur.is_none());

        manager.mark_eval_start().unwrap();
        let document = manager.read().unwrap();
        let end = document.run.end.expect("end set");
        let start = document.run.start.expect("start set");
        let dur = document.run.dur.expect("dur set");
        assert!((dur - duration_seconds(&start, &end).unwrap()).abs() < 1e-9);
        assert!(dur >= 0.0);
    }

    #[test]
    fn test_rerun_clears_previous_result() {
        let (_dir, manager) = manager();
        manager.mark_train_start().unwrap();
        manager.mark_eval_start().unwrap();
        manager.mark_done(report(), report()).unwrap();

        manager.mark_train_start().unwrap();
        let document = manager.read().unwrap();
        assert_eq!(document.run.status, RunState::Train);
        assert!(document.result.is_none());
        assert!(document.run.end.is_none());
        assert!(document.run.dur.is_none());
    }

    #[test]
    fn test_start_rejected_while_running() {
        let (_dir, manager) = manager();
        manager.mark_train_start().unwrap();
        assert!(manager.mark_train_start().is_err());

        manager.mark_eval_start().unwrap();
        assert!(manager.mark_train_start().is_err());
    }

    #[test]
    fn test_failed_records_error_and_end() {
        let (_dir, manager) = manager();
        manager.mark_train_start().unwrap();
        manager.mark_failed("loss exploded").unwrap();

        let document = manager.read().unwrap();
        assert_eq!(document.run.status, RunState::Failed);
        assert_eq!(document.run.error.as_deref(), Some("loss exploded"));
        assert!(document.run.end.is_some());
        assert!(document.run.dur.is_some());

        // Terminal: a second failure is rejected, but a re-run is allowed.
        assert!(manager.mark_failed("again").is_err());
        assert!(manager.mark_train_start().is_ok());
    }

    #[test]
    fn test_failed_before_start_has_no_end() {
        let (_dir, manager) = manager();
        manager.mark_failed("pre-flight failed").unwrap();
        let document = manager.read().unwrap();
        assert!(document.run.end.is_none());
        assert!(document.run.dur.is_none());
    }

    #[test]
    fn test_duration_seconds() {
        let dur =
            duration_seconds("2026-08-04 10:00:00.000000", "2026-08-04 10:00:01.500000").unwrap();
        assert!((dur - 1.5).abs() < 1e-9);
    }
}
