// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine phase types.
//!
//! Defines the state machine for the control loop.
//!
//! # Phase Transitions
//!
//! ```text
//!          start()
//! Idle ─────────────→ Connecting ──────→ RootReconcile ──────→ SteadyState
//!                        ↑  │                  │                    │
//!                        │  │ (read-only)      │ (error)            │ (error)
//!                        │  ↓                  ↓                    │
//!                        │ ReadOnly         Backoff ←───────────────┘
//!                        │                     │
//!                        └─────────────────────┘
//!
//!           stop() from any phase ──→ Stopped
//! ```
//!
//! - **Idle**: created, `start()` not called yet.
//! - **Connecting**: waiting for the document, index, and clock stores.
//! - **RootReconcile**: loading the root listing and the indexed set.
//! - **SteadyState**: accepting and processing jobs.
//! - **Backoff**: a loop error was recorded; waiting before reconnecting.
//! - **ReadOnly**: the local index rejects writes; the loop has exited.
//! - **Stopped**: cancelled on purpose.

/// Phase of the index sync control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Connecting,
    RootReconcile,
    SteadyState,
    Backoff,
    ReadOnly,
    Stopped,
}

impl EnginePhase {
    /// Phases after which the loop no longer runs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnginePhase::ReadOnly | EnginePhase::Stopped)
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Idle => write!(f, "Idle"),
            EnginePhase::Connecting => write!(f, "Connecting"),
            EnginePhase::RootReconcile => write!(f, "RootReconcile"),
            EnginePhase::SteadyState => write!(f, "SteadyState"),
            EnginePhase::Backoff => write!(f, "Backoff"),
            EnginePhase::ReadOnly => write!(f, "ReadOnly"),
            EnginePhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What a processed job amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    /// The root job diffed the desired and indexed sets.
    Reconciled,
    /// A document's blocks were rewritten and its clock persisted.
    Indexed,
    /// Nothing was written.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    NotIndexed,
    NoClock,
    Current,
    Missing,
    Empty,
    CrawlFailed,
}

impl SkipReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotIndexed => "not_indexed",
            SkipReason::NoClock => "no_clock",
            SkipReason::Current => "current",
            SkipReason::Missing => "missing",
            SkipReason::Empty => "empty",
            SkipReason::CrawlFailed => "crawl_failed",
        }
    }
}

impl JobOutcome {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Reconciled => "reconciled",
            JobOutcome::Indexed => "indexed",
            JobOutcome::Skipped(_) => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_phase_display() {
        assert_eq!(EnginePhase::Idle.to_string(), "Idle");
        assert_eq!(EnginePhase::Connecting.to_string(), "Connecting");
        assert_eq!(EnginePhase::RootReconcile.to_string(), "RootReconcile");
        assert_eq!(EnginePhase::SteadyState.to_string(), "SteadyState");
        assert_eq!(EnginePhase::Backoff.to_string(), "Backoff");
        assert_eq!(EnginePhase::ReadOnly.to_string(), "ReadOnly");
        assert_eq!(EnginePhase::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_terminal_phases() {
        assert!(EnginePhase::ReadOnly.is_terminal());
        assert!(EnginePhase::Stopped.is_terminal());
        assert!(!EnginePhase::Backoff.is_terminal());
        assert!(!EnginePhase::Idle.is_terminal());
    }

    #[test]
    fn test_job_outcome_labels() {
        assert_eq!(JobOutcome::Reconciled.as_str(), "reconciled");
        assert_eq!(JobOutcome::Indexed.as_str(), "indexed");
        assert_eq!(JobOutcome::Skipped(SkipReason::Current).as_str(), "skipped");
        assert_eq!(SkipReason::CrawlFailed.as_str(), "crawl_failed");
    }
}
