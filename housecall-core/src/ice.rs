//! Buffering for remote ICE candidates that outrun the remote description
//!
//! Offer/answer and candidates travel over the same unordered bus, so a
//! candidate can arrive before the description it belongs to. Candidates are
//! held here until the remote description is set, then drained exactly once
//! in arrival order.

use crate::types::IceCandidate;

/// What the session should do with a remote candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Remote description present; apply to the agent now
    Apply(IceCandidate),
    /// No remote description yet; held for the flush
    Buffered,
}

/// FIFO buffer for premature remote candidates
///
/// The flush happens exactly once, immediately after the remote description
/// is set; a second `mark_remote_description` drains nothing.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl IceCandidateBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a remote candidate
    ///
    /// Returns the candidate for immediate application once the remote
    /// description is known, otherwise buffers it.
    pub fn add(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.remote_description_set {
            CandidateDisposition::Apply(candidate)
        } else {
            self.pending.push(candidate);
            CandidateDisposition::Buffered
        }
    }

    /// Record that the remote description is now set and drain the backlog
    ///
    /// The returned candidates are in original arrival order. Only the first
    /// call drains; later calls return an empty vec.
    pub fn mark_remote_description(&mut self) -> Vec<IceCandidate> {
        if self.remote_description_set {
            return Vec::new();
        }
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }

    /// Whether the remote description has been recorded
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Number of candidates currently held
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any held candidates without applying them
    ///
    /// Called on teardown; a torn-down session never applies candidates.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
