use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::machine::{MachineState, MachineStatus};

/// Fleet-wide counters shown on the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub online: u32,
    pub offline: u32,
    pub locked: u32,
    pub unlocked: u32,
    pub total: u32,
    pub active: u32,
    pub inactive: u32,
    pub maintenance: u32,
}

impl AggregateCounts {
    /// Count a set of machines. Machines without a status contribute to
    /// none of the status counters.
    pub fn derive<'a>(machines: impl IntoIterator<Item = &'a MachineState>) -> Self {
        let mut counts = Self::default();
        for m in machines {
            counts.total += 1;
            if m.is_online {
                counts.online += 1;
            } else {
                counts.offline += 1;
            }
            if m.is_locked {
                counts.locked += 1;
            } else {
                counts.unlocked += 1;
            }
            match m.status {
                Some(MachineStatus::Active) => counts.active += 1,
                Some(MachineStatus::Inactive) => counts.inactive += 1,
                Some(MachineStatus::Maintenance) => counts.maintenance += 1,
                None => {}
            }
        }
        counts
    }
}

/// Body of the status-distribution endpoint. Missing counters read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusDistribution {
    pub online_count: u32,
    pub offline_count: u32,
    pub locked_count: u32,
    pub unlocked_count: u32,
    /// Total machine count; some deployments send the list instead.
    #[serde(deserialize_with = "count_or_list")]
    pub computers: u32,
    pub active_count: u32,
    pub inactive_count: u32,
    pub maintenance_count: u32,
}

impl From<StatusDistribution> for AggregateCounts {
    fn from(d: StatusDistribution) -> Self {
        Self {
            online: d.online_count,
            offline: d.offline_count,
            locked: d.locked_count,
            unlocked: d.unlocked_count,
            total: d.computers,
            active: d.active_count,
            inactive: d.inactive_count,
            maintenance: d.maintenance_count,
        }
    }
}

fn count_or_list<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_u64().map_or(0, |n| n.min(u32::MAX as u64) as u32),
        Value::Array(items) => items.len().min(u32::MAX as usize) as u32,
        _ => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachinePatch;
    use crate::time::Revision;

    fn machine(id: u64, online: bool, locked: bool, status: Option<MachineStatus>) -> MachineState {
        let mut patch = MachinePatch::default()
            .with_online(online)
            .with_locked(locked);
        patch.status = status;
        MachineState::from_patch(id, &patch, Revision(1))
    }

    #[test]
    fn derive_counts_every_dimension() {
        let machines = vec![
            machine(1, true, true, Some(MachineStatus::Active)),
            machine(2, true, false, Some(MachineStatus::Maintenance)),
            machine(3, false, true, None),
        ];
        let counts = AggregateCounts::derive(&machines);
        assert_eq!(
            counts,
            AggregateCounts {
                online: 2,
                offline: 1,
                locked: 2,
                unlocked: 1,
                total: 3,
                active: 1,
                inactive: 0,
                maintenance: 1,
            }
        );
    }

    #[test]
    fn derive_empty() {
        assert_eq!(AggregateCounts::derive(&[]), AggregateCounts::default());
    }

    #[test]
    fn distribution_with_missing_keys() {
        let d: StatusDistribution =
            serde_json::from_str(r#"{"online_count":4,"computers":10}"#).unwrap();
        let counts = AggregateCounts::from(d);
        assert_eq!(counts.online, 4);
        assert_eq!(counts.total, 10);
        assert_eq!(counts.maintenance, 0);
    }

    #[test]
    fn distribution_with_computer_list() {
        let d: StatusDistribution =
            serde_json::from_str(r#"{"computers":[{"id":1},{"id":2}],"locked_count":1}"#)
                .unwrap();
        assert_eq!(d.computers, 2);
        assert_eq!(d.locked_count, 1);
    }
}
