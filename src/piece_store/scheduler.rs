use crate::peers::PieceIndex;
use crate::prelude::*;
use crate::torrent::{Bitfield, Bitslice};
use rand::seq::IteratorRandom;
use std::collections::HashSet;

/// scheduling tier of a queued piece, `High` is requested first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// not scheduled yet, picked only after every queued tier.
    Backlog,
    Queued(Priority),
    /// reserved by exactly one connection. `release_to` is the tier it goes back to.
    InFlight { release_to: Priority },
    /// hash confirmed and persisted.
    Verified,
}

/// per-piece state plus one index set per state, kept in lockstep.
#[derive(Debug)]
pub(super) struct PieceScheduler {
    states: Vec<PieceState>,
    queued: [HashSet<PieceIndex>; 3],
    backlog: HashSet<PieceIndex>,
    in_flight: HashSet<PieceIndex>,
    bitfield: Bitfield,
}

impl PieceScheduler {
    pub fn new(piece_count: usize) -> Self {
        Self {
            states: vec![PieceState::Backlog; piece_count],
            queued: Default::default(),
            backlog: (0..piece_count).collect(),
            in_flight: HashSet::new(),
            bitfield: Bitfield::repeat(false, piece_count),
        }
    }

    pub fn state(&self, index: PieceIndex) -> Option<PieceState> {
        self.states.get(index).copied()
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn verified_count(&self) -> usize {
        self.bitfield.count_ones()
    }

    fn set_of(&mut self, state: PieceState) -> Option<&mut HashSet<PieceIndex>> {
        match state {
            PieceState::Backlog => Some(&mut self.backlog),
            PieceState::Queued(priority) => Some(&mut self.queued[priority as usize]),
            PieceState::InFlight { .. } => Some(&mut self.in_flight),
            PieceState::Verified => None,
        }
    }

    // the only place a piece changes state.
    fn transition(&mut self, index: PieceIndex, to: PieceState) {
        let from = self.states[index];
        if let Some(set) = self.set_of(from) {
            set.remove(&index);
        }
        if let Some(set) = self.set_of(to) {
            set.insert(index);
        }
        self.bitfield.set(index, to == PieceState::Verified);
        self.states[index] = to;
        trace!(index, ?from, ?to, "piece state transition");
    }

    /// reserves a random piece the peer has, searching tiers from highest to lowest and the
    /// backlog last.
    pub fn select(&mut self, peer_has: &Bitslice) -> Option<PieceIndex> {
        let mut rng = rand::thread_rng();
        let has = |index: &PieceIndex| peer_has.get(*index).is_some_and(|bit| *bit);

        let (index, release_to) = Priority::ALL
            .iter()
            .map(|&priority| (&self.queued[priority as usize], priority))
            .chain(std::iter::once((&self.backlog, Priority::Low)))
            .find_map(|(tier, release_to)| {
                let index = tier.iter().copied().filter(has).choose(&mut rng)?;
                Some((index, release_to))
            })?;

        self.transition(index, PieceState::InFlight { release_to });
        Some(index)
    }

    /// returns an in flight piece to its queue; anything else is left alone.
    pub fn release(&mut self, index: PieceIndex) -> bool {
        match self.state(index) {
            Some(PieceState::InFlight { release_to }) => {
                self.transition(index, PieceState::Queued(release_to));
                true
            }
            _ => false,
        }
    }

    /// marks a piece verified, returning false if it already was.
    pub fn verify(&mut self, index: PieceIndex) -> bool {
        match self.state(index) {
            Some(PieceState::Verified) | None => false,
            Some(_) => {
                self.transition(index, PieceState::Verified);
                true
            }
        }
    }

    pub fn set_priority(&mut self, index: PieceIndex, priority: Priority) {
        match self.state(index) {
            Some(PieceState::Backlog | PieceState::Queued(_)) => {
                self.transition(index, PieceState::Queued(priority))
            }
            Some(PieceState::InFlight { .. }) => {
                self.states[index] = PieceState::InFlight {
                    release_to: priority,
                }
            }
            Some(PieceState::Verified) | None => {}
        }
    }

    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (index, state) in self.states.iter().enumerate() {
            let in_backlog = self.backlog.contains(&index);
            let in_flight = self.in_flight.contains(&index);
            let tiers: Vec<_> = Priority::ALL
                .iter()
                .filter(|&&p| self.queued[p as usize].contains(&index))
                .collect();

            let expected = match state {
                PieceState::Backlog => in_backlog && !in_flight && tiers.is_empty(),
                PieceState::Queued(p) => !in_backlog && !in_flight && tiers == vec![p],
                PieceState::InFlight { .. } => !in_backlog && in_flight && tiers.is_empty(),
                PieceState::Verified => !in_backlog && !in_flight && tiers.is_empty(),
            };
            assert!(expected, "piece {index} in {state:?} has inconsistent tier membership");
            assert_eq!(self.bitfield[index], *state == PieceState::Verified);
        }
    }
}
