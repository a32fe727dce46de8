use serde::{Deserialize, Serialize};

use crate::time::Revision;

/// Server-assigned machine identifier.
pub type MachineId = u64;

/// Administrative status of a machine, independent of its network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Active,
    Inactive,
    Maintenance,
}

impl MachineStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Maintenance => "maintenance",
        }
    }
}

/// Fields of [`MachineState`] that can be patched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineField {
    IpAddress,
    Number,
    Laboratory,
    Online,
    Locked,
    Status,
}

/// Partial machine state. `None` means "not present in this write".
///
/// `laboratory_id` is doubly optional so a write can clear the assignment
/// (`Some(None)`) as well as leave it alone (`None`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachinePatch {
    pub ip_address: Option<String>,
    pub number: Option<String>,
    pub laboratory_id: Option<Option<u64>>,
    pub is_online: Option<bool>,
    pub is_locked: Option<bool>,
    pub status: Option<MachineStatus>,
}

impl MachinePatch {
    /// The patch an unlock outcome applies.
    pub fn unlocked() -> Self {
        Self {
            is_locked: Some(false),
            ..Self::default()
        }
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.is_online = Some(online);
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.is_locked = Some(locked);
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn with_laboratory(mut self, laboratory_id: Option<u64>) -> Self {
        self.laboratory_id = Some(laboratory_id);
        self
    }

    pub fn with_status(mut self, status: MachineStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ip_address.is_none()
            && self.number.is_none()
            && self.laboratory_id.is_none()
            && self.is_online.is_none()
            && self.is_locked.is_none()
            && self.status.is_none()
    }
}

/// Revision of the write that last set each field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldRevisions {
    ip_address: Revision,
    number: Revision,
    laboratory: Revision,
    online: Revision,
    locked: Revision,
    status: Revision,
}

/// Last-known state of one managed machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub id: MachineId,
    pub ip_address: String,
    pub number: Option<String>,
    pub laboratory_id: Option<u64>,
    pub is_online: bool,
    pub is_locked: bool,
    pub status: Option<MachineStatus>,
    /// Highest revision merged into this entry.
    pub last_seen_at: Revision,
    revisions: FieldRevisions,
}

impl MachineState {
    /// An entry with every field at its default and every field revision at
    /// zero, so that any later write wins.
    pub fn empty(id: MachineId) -> Self {
        Self {
            id,
            ip_address: String::new(),
            number: None,
            laboratory_id: None,
            is_online: false,
            is_locked: false,
            status: None,
            last_seen_at: Revision::ZERO,
            revisions: FieldRevisions::default(),
        }
    }

    /// Build an entry from a full record, stamping every present field with
    /// `revision`.
    pub fn from_patch(id: MachineId, patch: &MachinePatch, revision: Revision) -> Self {
        let mut state = Self::empty(id);
        state.apply(patch, revision);
        state.last_seen_at = revision;
        state
    }

    /// Display label, e.g. `PC-12`. Falls back to the id when no number is
    /// known.
    pub fn label(&self) -> String {
        match &self.number {
            Some(n) => format!("PC-{n}"),
            None => format!("PC-{}", self.id),
        }
    }

    /// Revision that last set `field`.
    pub fn field_revision(&self, field: MachineField) -> Revision {
        match field {
            MachineField::IpAddress => self.revisions.ip_address,
            MachineField::Number => self.revisions.number,
            MachineField::Laboratory => self.revisions.laboratory,
            MachineField::Online => self.revisions.online,
            MachineField::Locked => self.revisions.locked,
            MachineField::Status => self.revisions.status,
        }
    }

    /// Apply every field of `patch` whose stored revision is not newer than
    /// `revision`. Returns the fields that were written and, if any field was
    /// refused, the highest stored revision that refused it.
    ///
    /// Does not touch `last_seen_at`.
    pub(crate) fn apply(
        &mut self,
        patch: &MachinePatch,
        revision: Revision,
    ) -> (Vec<MachineField>, Option<Revision>) {
        let mut applied = Vec::new();
        let mut refused: Option<Revision> = None;

        fn gate(
            stored: &mut Revision,
            incoming: Revision,
            field: MachineField,
            applied: &mut Vec<MachineField>,
            refused: &mut Option<Revision>,
        ) -> bool {
            if incoming >= *stored {
                *stored = incoming;
                applied.push(field);
                true
            } else {
                *refused = Some(refused.map_or(*stored, |r| r.max(*stored)));
                false
            }
        }

        if let Some(ip) = &patch.ip_address
            && gate(
                &mut self.revisions.ip_address,
                revision,
                MachineField::IpAddress,
                &mut applied,
                &mut refused,
            )
        {
            self.ip_address = ip.clone();
        }
        if let Some(number) = &patch.number
            && gate(
                &mut self.revisions.number,
                revision,
                MachineField::Number,
                &mut applied,
                &mut refused,
            )
        {
            self.number = Some(number.clone());
        }
        if let Some(lab) = patch.laboratory_id
            && gate(
                &mut self.revisions.laboratory,
                revision,
                MachineField::Laboratory,
                &mut applied,
                &mut refused,
            )
        {
            self.laboratory_id = lab;
        }
        if let Some(online) = patch.is_online
            && gate(
                &mut self.revisions.online,
                revision,
                MachineField::Online,
                &mut applied,
                &mut refused,
            )
        {
            self.is_online = online;
        }
        if let Some(locked) = patch.is_locked
            && gate(
                &mut self.revisions.locked,
                revision,
                MachineField::Locked,
                &mut applied,
                &mut refused,
            )
        {
            self.is_locked = locked;
        }
        if let Some(status) = patch.status
            && gate(
                &mut self.revisions.status,
                revision,
                MachineField::Status,
                &mut applied,
                &mut refused,
            )
        {
            self.status = Some(status);
        }

        (applied, refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(MachineStatus::parse("Active"), Some(MachineStatus::Active));
        assert_eq!(
            MachineStatus::parse(" MAINTENANCE "),
            Some(MachineStatus::Maintenance)
        );
        assert_eq!(MachineStatus::parse("online"), None);
    }

    #[test]
    fn status_json_values() {
        assert_eq!(
            serde_json::to_string(&MachineStatus::Maintenance).unwrap(),
            "\"maintenance\""
        );
    }

    #[test]
    fn empty_patch() {
        assert!(MachinePatch::default().is_empty());
        assert!(!MachinePatch::unlocked().is_empty());
        assert!(!MachinePatch::default().with_laboratory(None).is_empty());
    }

    #[test]
    fn label_prefers_machine_number() {
        let mut state = MachineState::empty(7);
        assert_eq!(state.label(), "PC-7");
        state.number = Some("12".to_string());
        assert_eq!(state.label(), "PC-12");
    }

    #[test]
    fn from_patch_stamps_present_fields_only() {
        let patch = MachinePatch::default()
            .with_online(true)
            .with_ip("10.0.0.5");
        let state = MachineState::from_patch(1, &patch, Revision(10));
        assert!(state.is_online);
        assert_eq!(state.ip_address, "10.0.0.5");
        assert_eq!(state.last_seen_at, Revision(10));
        assert_eq!(state.field_revision(MachineField::Online), Revision(10));
        assert_eq!(state.field_revision(MachineField::Locked), Revision::ZERO);
    }

    #[test]
    fn apply_refuses_older_fields_and_reports_them() {
        let mut state = MachineState::from_patch(
            1,
            &MachinePatch::default().with_locked(true),
            Revision(5),
        );
        let (applied, refused) = state.apply(
            &MachinePatch::default().with_locked(false).with_online(true),
            Revision(4),
        );
        assert_eq!(applied, vec![MachineField::Online]);
        assert_eq!(refused, Some(Revision(5)));
        assert!(state.is_locked);
        assert!(state.is_online);
    }

    #[test]
    fn apply_can_clear_laboratory() {
        let mut state = MachineState::from_patch(
            1,
            &MachinePatch::default().with_laboratory(Some(3)),
            Revision(1),
        );
        assert_eq!(state.laboratory_id, Some(3));
        state.apply(&MachinePatch::default().with_laboratory(None), Revision(2));
        assert_eq!(state.laboratory_id, None);
    }
}
