//
// lifecycle.rs
// MedImg-Pipeline
//
// Study processing state machine: uploaded -> processing -> completed | failed.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl StudyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudyStatus::Uploaded => "uploaded",
            StudyStatus::Processing => "processing",
            StudyStatus::Completed => "completed",
            StudyStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StudyStatus::Completed | StudyStatus::Failed)
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processing attempt of a study. Terminal instances are never reopened; `resubmit`
/// starts a new attempt instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyLifecycle {
    status: StudyStatus,
    attempt: u32,
}

impl Default for StudyLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl StudyLifecycle {
    pub fn new() -> Self {
        Self {
            status: StudyStatus::Uploaded,
            attempt: 1,
        }
    }

    pub fn status(&self) -> StudyStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn begin(&mut self) -> Result<(), LifecycleError> {
        match self.status {
            StudyStatus::Uploaded => self.transition(StudyStatus::Processing),
            StudyStatus::Processing => Err(LifecycleError::AlreadyProcessing),
            terminal => Err(LifecycleError::Terminal(terminal.as_str())),
        }
    }

    pub fn succeed(&mut self) -> Result<(), LifecycleError> {
        self.finish("succeed", StudyStatus::Completed)
    }

    pub fn fail(&mut self) -> Result<(), LifecycleError> {
        self.finish("fail", StudyStatus::Failed)
    }

    /// Fresh `uploaded` lifecycle for another attempt at a finished study.
    pub fn resubmit(&self) -> Result<Self, LifecycleError> {
        if !self.is_terminal() {
            return Err(LifecycleError::InvalidTransition {
                event: "resubmit",
                state: self.status.as_str(),
            });
        }
        info!(attempt = self.attempt + 1, "study resubmitted");
        Ok(Self {
            status: StudyStatus::Uploaded,
            attempt: self.attempt + 1,
        })
    }

    fn finish(&mut self, event: &'static str, to: StudyStatus) -> Result<(), LifecycleError> {
        if self.status != StudyStatus::Processing {
            return Err(LifecycleError::InvalidTransition {
                event,
                state: self.status.as_str(),
            });
        }
        self.transition(to)
    }

    fn transition(&mut self, to: StudyStatus) -> Result<(), LifecycleError> {
        info!(from = %self.status, %to, attempt = self.attempt, "study status changed");
        self.status = to;
        Ok(())
    }
}
