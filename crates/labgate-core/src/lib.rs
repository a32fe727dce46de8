pub mod activity;
pub mod counts;
pub mod events;
pub mod machine;
pub mod mirror;
pub mod pagination;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use serde_json::{Value, json};

    use crate::activity::{ScanEvent, ScanId};
    use crate::machine::{MachineId, MachinePatch, MachineState, MachineStatus};
    use crate::time::Revision;

    /// A locked, online, active machine numbered after its id.
    pub fn make_machine(id: MachineId, revision: u64) -> MachineState {
        let patch = MachinePatch::default()
            .with_ip(format!("10.0.0.{id}"))
            .with_number(id.to_string())
            .with_online(true)
            .with_locked(true)
            .with_status(MachineStatus::Active);
        MachineState::from_patch(id, &patch, Revision(revision))
    }

    /// `n` machines with ids starting at 1.
    pub fn make_machines(n: usize, revision: u64) -> Vec<MachineState> {
        (1..=n as MachineId)
            .map(|id| make_machine(id, revision))
            .collect()
    }

    /// A machine object as the REST listing returns it.
    pub fn machine_json(id: MachineId, locked: bool) -> Value {
        json!({
            "id": id,
            "ip_address": format!("10.0.0.{id}"),
            "computer_number": id.to_string(),
            "laboratory_id": null,
            "is_online": true,
            "is_locked": locked,
            "status": "active",
        })
    }

    /// A push payload for a lock-state change at `revision`.
    pub fn lock_push(id: MachineId, locked: bool, revision: u64) -> Value {
        json!({
            "computer": { "id": id, "is_locked": locked },
            "revision": revision,
        })
    }

    /// A scan event with a server id.
    pub fn make_scan(log_id: u64, name: &str) -> ScanEvent {
        ScanEvent::new(
            ScanId::Server(log_id),
            Some(name),
            format!("PC-{log_id}"),
            "10.0.0.1",
            log_id,
        )
    }
}
