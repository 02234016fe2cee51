//! Per-peer gossip round bookkeeping.
//!
//! A round is the three-way exchange SYN -> ACK -> ACK2. The initiator sits
//! in `SynSent` until the ACK arrives (it then sends ACK2 and the round is
//! done); the responder sits in `AckReplied` until the ACK2 arrives. Done is
//! represented by removal -- the table holds only in-flight rounds.
//!
//! The two directions are independent: this node can be initiating toward a
//! peer while simultaneously responding to that peer's own SYN, so each side
//! is tracked separately. A new round toward a peer is allowed before the
//! previous one completed; it simply replaces the stale entry.
//!
//! Timeouts are soft deadlines. An abandoned round rolls nothing back:
//! whatever was merged from an ACK stays merged.

use std::collections::HashMap;

use lodestone_core::NodeId;

/// Where an in-flight round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Initiator: SYN sent, waiting for the peer's ACK.
    SynSent,
    /// Responder: ACK sent, waiting for the peer's ACK2.
    AckReplied,
}

/// One in-flight round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub phase: RoundPhase,
    /// Unique id tying timeout timers to the round they were armed for.
    pub round: u64,
    pub started_ms: u64,
}

/// In-flight rounds for all peers, both directions.
#[derive(Debug, Default)]
pub struct RoundTable {
    initiated: HashMap<NodeId, Round>,
    responding: HashMap<NodeId, Round>,
    next_round: u64,
}

impl RoundTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) an initiated round toward `peer` and returns its
    /// id for the timeout timer.
    pub fn begin_initiated(&mut self, peer: NodeId, now_ms: u64) -> u64 {
        self.begin(peer, now_ms, RoundPhase::SynSent)
    }

    /// Records that an ACK was sent to `peer` and returns the round id.
    pub fn begin_responding(&mut self, peer: NodeId, now_ms: u64) -> u64 {
        self.begin(peer, now_ms, RoundPhase::AckReplied)
    }

    fn begin(&mut self, peer: NodeId, now_ms: u64, phase: RoundPhase) -> u64 {
        self.next_round += 1;
        let round = Round {
            phase,
            round: self.next_round,
            started_ms: now_ms,
        };
        match phase {
            RoundPhase::SynSent => self.initiated.insert(peer, round),
            RoundPhase::AckReplied => self.responding.insert(peer, round),
        };
        self.next_round
    }

    /// An ACK arrived from `peer`. Returns `true` when it answers an
    /// outstanding SYN (the round completes); `false` for an unsolicited or
    /// late ACK, whose deltas the caller may still merge.
    pub fn complete_initiated(&mut self, peer: NodeId) -> bool {
        self.initiated.remove(&peer).is_some()
    }

    /// An ACK2 arrived from `peer`. Returns `true` when it closes an
    /// outstanding responder round.
    pub fn complete_responding(&mut self, peer: NodeId) -> bool {
        self.responding.remove(&peer).is_some()
    }

    /// A round timer fired. Abandons the round if it is still the one the
    /// timer was armed for; returns `true` when something was abandoned.
    pub fn on_timeout(&mut self, peer: NodeId, round: u64) -> bool {
        if self
            .initiated
            .get(&peer)
            .is_some_and(|current| current.round == round)
        {
            self.initiated.remove(&peer);
            return true;
        }
        if self
            .responding
            .get(&peer)
            .is_some_and(|current| current.round == round)
        {
            self.responding.remove(&peer);
            return true;
        }
        false
    }

    /// Current initiated-side phase toward `peer`.
    #[must_use]
    pub fn initiated_round(&self, peer: NodeId) -> Option<Round> {
        self.initiated.get(&peer).copied()
    }

    /// Current responder-side phase toward `peer`.
    #[must_use]
    pub fn responding_round(&self, peer: NodeId) -> Option<Round> {
        self.responding.get(&peer).copied()
    }

    /// Number of in-flight rounds across both directions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.initiated.len() + self.responding.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
