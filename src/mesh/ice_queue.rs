use crate::rtc::IceCandidate;
use std::collections::VecDeque;

/// What to do with a candidate handed to [`IceCandidateQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Held until the remote description is set.
    Queued,
    /// The queue was already drained; apply immediately.
    ApplyNow(IceCandidate),
}

/// Candidates that arrived before the remote description.
///
/// Drained in arrival order exactly once; after that every candidate is
/// handed straight back to be applied.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) -> QueueOutcome {
        if self.drained {
            return QueueOutcome::ApplyNow(candidate);
        }
        self.pending.push_back(candidate);
        QueueOutcome::Queued
    }

    /// Take everything queued so far. Only the first call returns anything.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}
