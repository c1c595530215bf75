use std::collections::HashSet;
use std::fmt;

use crate::signaling::{CandidateList, RecordField, SessionRecord};
use crate::transport::{IceCandidateBlob, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// List this role appends its own candidates to.
    pub fn local_list(&self) -> CandidateList {
        match self {
            Role::Initiator => CandidateList::Initiator,
            Role::Responder => CandidateList::Responder,
        }
    }

    /// List carrying the other role's candidates.
    pub fn remote_list(&self) -> CandidateList {
        match self {
            Role::Initiator => CandidateList::Responder,
            Role::Responder => CandidateList::Initiator,
        }
    }

    pub fn local_field(&self) -> RecordField {
        match self {
            Role::Initiator => RecordField::Offer,
            Role::Responder => RecordField::Answer,
        }
    }

    pub fn remote_field(&self) -> RecordField {
        match self {
            Role::Initiator => RecordField::Answer,
            Role::Responder => RecordField::Offer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    DescriptionExchanged,
    CandidatesFlowing,
    Ready,
    Failed,
}

/// What to do with a candidate read from the remote list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAction {
    Apply(IceCandidateBlob),
    /// Held until the remote description has been applied.
    Queued,
    /// Already applied or queued once.
    Duplicate,
    /// The handshake is over.
    Ignored,
}

/// Bookkeeping for one connection attempt. Pure state: the caller performs the transport work
/// and reports completion back.
#[derive(Debug)]
pub struct HandshakeController {
    role: Role,
    phase: HandshakePhase,
    remote_description_taken: bool,
    remote_description_set: bool,
    queued: Vec<IceCandidateBlob>,
    seen: HashSet<IceCandidateBlob>,
}

impl HandshakeController {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: HandshakePhase::Idle,
            remote_description_taken: false,
            remote_description_set: false,
            queued: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn queued_candidates(&self) -> usize {
        self.queued.len()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, HandshakePhase::Ready | HandshakePhase::Failed)
    }

    /// Returns the remote description to apply the first time it shows up in a snapshot.
    /// Later snapshots, changed or not, never hand it out again.
    pub fn on_record_snapshot(&mut self, record: &SessionRecord) -> Option<SessionDescription> {
        if self.remote_description_taken || self.phase == HandshakePhase::Failed {
            return None;
        }
        let description = record.field(self.role.remote_field())?.clone();
        self.remote_description_taken = true;
        tracing::debug!(
            target = "beach_chat::handshake",
            role = self.role.as_str(),
            session_id = %record.id,
            "remote description observed"
        );
        Some(description)
    }

    /// Marks the remote description applied and hands back every candidate queued before it.
    pub fn on_remote_description_applied(&mut self) -> Vec<IceCandidateBlob> {
        self.remote_description_set = true;
        if !self.is_terminal() {
            self.phase = HandshakePhase::DescriptionExchanged;
        }
        let flushed = std::mem::take(&mut self.queued);
        if !flushed.is_empty() && self.phase == HandshakePhase::DescriptionExchanged {
            self.phase = HandshakePhase::CandidatesFlowing;
        }
        tracing::debug!(
            target = "beach_chat::handshake",
            role = self.role.as_str(),
            flushed = flushed.len(),
            "remote description applied"
        );
        flushed
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidateBlob) -> CandidateAction {
        if self.phase == HandshakePhase::Failed {
            return CandidateAction::Ignored;
        }
        if !self.seen.insert(candidate.clone()) {
            return CandidateAction::Duplicate;
        }
        if !self.remote_description_set {
            self.queued.push(candidate);
            return CandidateAction::Queued;
        }
        if self.phase == HandshakePhase::DescriptionExchanged {
            self.phase = HandshakePhase::CandidatesFlowing;
        }
        CandidateAction::Apply(candidate)
    }

    /// Returns `true` the first time the channel opens.
    pub fn on_channel_open(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = HandshakePhase::Ready;
        true
    }

    /// Returns `true` if this call moved the handshake to `Failed`.
    pub fn fail(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        tracing::warn!(
            target = "beach_chat::handshake",
            role = self.role.as_str(),
            phase = ?self.phase,
            reason,
            "handshake failed"
        );
        self.phase = HandshakePhase::Failed;
        self.queued.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::RecordId;

    fn record_with_answer(answer: Option<&str>) -> SessionRecord {
        SessionRecord {
            id: RecordId::from("r1"),
            offer: Some(SessionDescription::offer("offer")),
            answer: answer.map(SessionDescription::answer),
        }
    }

    #[test_timeout::timeout]
    fn early_candidates_are_queued_then_flushed_once() {
        let mut controller = HandshakeController::new(Role::Initiator);
        let a = IceCandidateBlob::new("a");
        let b = IceCandidateBlob::new("b");

        assert_eq!(controller.on_remote_candidate(a.clone()), CandidateAction::Queued);
        assert_eq!(controller.on_remote_candidate(a.clone()), CandidateAction::Duplicate);
        assert_eq!(controller.queued_candidates(), 1);

        let flushed = controller.on_remote_description_applied();
        assert_eq!(flushed, vec![a.clone()]);
        assert_eq!(controller.phase(), HandshakePhase::CandidatesFlowing);

        assert_eq!(controller.on_remote_candidate(a), CandidateAction::Duplicate);
        assert_eq!(controller.on_remote_candidate(b.clone()), CandidateAction::Apply(b));
    }

    #[test_timeout::timeout]
    fn only_first_answer_is_used() {
        let mut controller = HandshakeController::new(Role::Initiator);
        assert!(controller.on_record_snapshot(&record_with_answer(None)).is_none());

        let answer = controller
            .on_record_snapshot(&record_with_answer(Some("ans")))
            .unwrap();
        assert_eq!(answer.sdp, "ans");
        assert!(controller.on_record_snapshot(&record_with_answer(Some("ans"))).is_none());
        assert!(controller.on_record_snapshot(&record_with_answer(Some("other"))).is_none());
    }

    #[test_timeout::timeout]
    fn responder_takes_offer() {
        let mut controller = HandshakeController::new(Role::Responder);
        assert_eq!(controller.role().local_list(), CandidateList::Responder);
        let offer = controller
            .on_record_snapshot(&record_with_answer(None))
            .unwrap();
        assert_eq!(offer.sdp, "offer");
    }

    #[test_timeout::timeout]
    fn open_and_fail_are_terminal() {
        let mut controller = HandshakeController::new(Role::Responder);
        controller.on_remote_description_applied();
        assert_eq!(controller.phase(), HandshakePhase::DescriptionExchanged);
        assert!(controller.on_channel_open());
        assert!(!controller.on_channel_open());
        assert!(!controller.fail("late"));
        assert_eq!(controller.phase(), HandshakePhase::Ready);

        let mut failing = HandshakeController::new(Role::Initiator);
        assert!(failing.fail("boom"));
        assert_eq!(
            failing.on_remote_candidate(IceCandidateBlob::new("x")),
            CandidateAction::Ignored
        );
        assert!(!failing.on_channel_open());
    }
}
