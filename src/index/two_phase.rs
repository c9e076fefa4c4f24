//! Two-phase commit across several participants.
//!
//! Each participant first makes its changes durable without publishing them
//! ([`TwoPhaseCommit::prepare_commit`]), then publishes them
//! ([`TwoPhaseCommit::commit`]). If any participant fails to prepare, every
//! participant is rolled back and nothing becomes visible.

use log::{info, warn};
use thiserror::Error;

use crate::error::SegdexError;

/// Something that can commit in two phases, such as an
/// [`IndexWriter`](crate::index::writer::IndexWriter).
pub trait TwoPhaseCommit {
    /// Make pending changes durable without publishing them.
    fn prepare_commit(&self) -> Result<(), SegdexError>;

    /// Publish prepared changes.
    fn commit(&self) -> Result<(), SegdexError>;

    /// Discard prepared or pending changes.
    fn rollback(&self) -> Result<(), SegdexError>;
}

/// Phase reached by [`TwoPhaseCommitCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPhase {
    #[default]
    Idle,
    Prepared,
    Committed,
    RolledBack,
}

/// Failure of a coordinated commit.
#[derive(Debug, Error)]
pub enum TwoPhaseCommitError {
    /// A participant failed to prepare. Every participant was rolled back.
    #[error("participant {participant} failed to prepare: {source}")]
    PrepareFailed {
        participant: usize,
        #[source]
        source: SegdexError,
    },

    /// A participant failed to commit after all prepared. Every participant
    /// was rolled back; those that already committed stay committed.
    #[error("participant {participant} failed to commit: {source}")]
    CommitFailed {
        participant: usize,
        #[source]
        source: SegdexError,
    },
}

impl TwoPhaseCommitError {
    pub fn participant(&self) -> usize {
        match self {
            TwoPhaseCommitError::PrepareFailed { participant, .. }
            | TwoPhaseCommitError::CommitFailed { participant, .. } => *participant,
        }
    }
}

/// Runs a two-phase commit and records how far it got.
#[derive(Debug, Default)]
pub struct TwoPhaseCommitCoordinator {
    phase: CommitPhase,
    committed: usize,
}

impl TwoPhaseCommitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    /// Number of participants whose commit succeeded in the last run.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Prepare every participant, then commit every participant.
    pub fn execute(&mut self, participants: &[&dyn TwoPhaseCommit]) -> Result<(), TwoPhaseCommitError> {
        self.phase = CommitPhase::Idle;
        self.committed = 0;

        for (idx, participant) in participants.iter().enumerate() {
            if let Err(source) = participant.prepare_commit() {
                warn!("participant {idx} failed to prepare: {source}");
                self.rollback_all(participants);
                return Err(TwoPhaseCommitError::PrepareFailed {
                    participant: idx,
                    source,
                });
            }
        }
        self.phase = CommitPhase::Prepared;

        for (idx, participant) in participants.iter().enumerate() {
            if let Err(source) = participant.commit() {
                warn!("participant {idx} failed to commit: {source}");
                self.rollback_all(participants);
                return Err(TwoPhaseCommitError::CommitFailed {
                    participant: idx,
                    source,
                });
            }
            self.committed += 1;
        }
        self.phase = CommitPhase::Committed;
        info!("two-phase commit of {} participants done", participants.len());
        Ok(())
    }

    fn rollback_all(&mut self, participants: &[&dyn TwoPhaseCommit]) {
        for (idx, participant) in participants.iter().enumerate() {
            if let Err(e) = participant.rollback() {
                warn!("rollback of participant {idx} failed: {e}");
            }
        }
        self.phase = CommitPhase::RolledBack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Participant {
        fail_prepare: bool,
        fail_commit: bool,
        log: Mutex<Vec<&'static str>>,
    }

    impl TwoPhaseCommit for Participant {
        fn prepare_commit(&self) -> Result<(), SegdexError> {
            self.log.lock().push("prepare");
            if self.fail_prepare {
                return Err(SegdexError::storage("disk full"));
            }
            Ok(())
        }

        fn commit(&self) -> Result<(), SegdexError> {
            self.log.lock().push("commit");
            if self.fail_commit {
                return Err(SegdexError::storage("rename failed"));
            }
            Ok(())
        }

        fn rollback(&self) -> Result<(), SegdexError> {
            self.log.lock().push("rollback");
            Ok(())
        }
    }

    #[test]
    fn test_all_commit() {
        let a = Participant::default();
        let b = Participant::default();
        let mut coordinator = TwoPhaseCommitCoordinator::new();
        coordinator.execute(&[&a, &b]).unwrap();
        assert_eq!(coordinator.phase(), CommitPhase::Committed);
        assert_eq!(coordinator.committed(), 2);
        assert_eq!(*a.log.lock(), vec!["prepare", "commit"]);
    }

    #[test]
    fn test_prepare_failure_rolls_back_everyone() {
        let a = Participant::default();
        let b = Participant {
            fail_prepare: true,
            ..Default::default()
        };
        let c = Participant::default();
        let mut coordinator = TwoPhaseCommitCoordinator::new();
        let err = coordinator.execute(&[&a, &b, &c]).unwrap_err();

        assert!(matches!(err, TwoPhaseCommitError::PrepareFailed { participant: 1, .. }));
        assert_eq!(coordinator.phase(), CommitPhase::RolledBack);
        assert_eq!(coordinator.committed(), 0);
        assert_eq!(*a.log.lock(), vec!["prepare", "rollback"]);
        assert_eq!(*c.log.lock(), vec!["rollback"]);
    }

    #[test]
    fn test_commit_failure_is_partial() {
        let a = Participant::default();
        let b = Participant {
            fail_commit: true,
            ..Default::default()
        };
        let mut coordinator = TwoPhaseCommitCoordinator::new();
        let err = coordinator.execute(&[&a, &b]).unwrap_err();
        assert_eq!(err.participant(), 1);
        assert_eq!(coordinator.committed(), 1);
        assert_eq!(coordinator.phase(), CommitPhase::RolledBack);
    }
}
