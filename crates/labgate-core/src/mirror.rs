use std::collections::HashMap;

use crate::machine::{MachineField, MachineId, MachinePatch, MachineState};
use crate::time::Revision;

/// Result of merging one patch into the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The machine was unknown and has been created from the patch.
    Created,
    /// At least the listed fields were written. An empty list means the
    /// patch only advanced `last_seen_at`.
    Applied { fields: Vec<MachineField> },
    /// Every field in the patch was older than what is stored; nothing
    /// changed.
    Stale { stored: Revision, incoming: Revision },
}

impl MergeOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Client-side mirror of every known machine, keyed by id.
#[derive(Debug, Default)]
pub struct MachineMirror {
    machines: HashMap<MachineId, MachineState>,
}

impl MachineMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MachineId) -> Option<&MachineState> {
        self.machines.get(&id)
    }

    /// Merge `patch` into machine `id` at `revision`.
    ///
    /// Each field is written only if `revision` is not older than the
    /// revision that last wrote that field; equal revisions favour the
    /// incoming patch. Unknown machines are created.
    pub fn merge_patch(
        &mut self,
        id: MachineId,
        patch: &MachinePatch,
        revision: Revision,
    ) -> MergeOutcome {
        let Some(state) = self.machines.get_mut(&id) else {
            self.machines
                .insert(id, MachineState::from_patch(id, patch, revision));
            return MergeOutcome::Created;
        };

        let (fields, refused) = state.apply(patch, revision);
        if fields.is_empty() {
            // Nothing written: either every field was older, or the patch
            // was a bare revision marker.
            if let Some(stored) = refused {
                return MergeOutcome::Stale {
                    stored,
                    incoming: revision,
                };
            }
            if revision < state.last_seen_at {
                return MergeOutcome::Stale {
                    stored: state.last_seen_at,
                    incoming: revision,
                };
            }
        }
        state.last_seen_at = state.last_seen_at.max(revision);
        MergeOutcome::Applied { fields }
    }

    /// Replace the whole mirror with a fresh enumeration. Later duplicates of
    /// the same id win.
    pub fn replace_all(&mut self, machines: impl IntoIterator<Item = MachineState>) {
        self.machines = machines.into_iter().map(|m| (m.id, m)).collect();
    }

    /// Evict a machine after an explicit removal.
    pub fn remove(&mut self, id: MachineId) -> Option<MachineState> {
        self.machines.remove(&id)
    }

    pub fn clear(&mut self) {
        self.machines.clear();
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MachineState> {
        self.machines.values()
    }

    /// All machines ordered by id, for stable rendering.
    pub fn sorted(&self) -> Vec<&MachineState> {
        let mut list: Vec<_> = self.machines.values().collect();
        list.sort_by_key(|m| m.id);
        list
    }
}
