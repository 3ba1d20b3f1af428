//! Roster of participants present in a collaborative session.
//!
//! Inserts are idempotent by participant id: a second `upsert` for an id that
//! is already present changes nothing. Removes of unknown ids are no-ops.
//! Snapshots are returned in insertion order.

use crate::model::{Participant, ParticipantId};

#[derive(Debug, Default, Clone)]
pub struct PresenceRegistry {
    entries: Vec<Participant>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `participant` unless its id is already present.
    ///
    /// Returns `true` when the roster changed.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        if self.contains(&participant.participant_id) {
            return false;
        }
        self.entries.push(participant);
        true
    }

    /// Remove by id. Returns the removed entry, or `None` if it was absent.
    pub fn remove(&mut self, participant_id: &ParticipantId) -> Option<Participant> {
        let idx = self
            .entries
            .iter()
            .position(|p| &p.participant_id == participant_id)?;
        Some(self.entries.remove(idx))
    }

    /// Merge a full roster delivery (`online_users`) without dropping anyone
    /// already present. Returns how many entries were added.
    pub fn merge_roster(&mut self, roster: impl IntoIterator<Item = Participant>) -> usize {
        roster
            .into_iter()
            .map(|p| self.upsert(p))
            .filter(|added| *added)
            .count()
    }

    /// Drop everyone. Returns `true` if the roster was non-empty.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.entries.is_empty();
        self.entries.clear();
        had_any
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.entries.iter().any(|p| &p.participant_id == participant_id)
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<&Participant> {
        self.entries.iter().find(|p| &p.participant_id == participant_id)
    }

    pub fn snapshot(&self) -> Vec<Participant> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
