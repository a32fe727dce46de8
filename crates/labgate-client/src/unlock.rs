//! Badge-triggered and administrative unlocks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::{Value, json};

use labgate_core::activity::{PushResult, ScanEvent, ScanId};
use labgate_core::events::normalize_record;
use labgate_core::machine::{MachineId, MachinePatch};
use labgate_core::time::{Revision, now_millis};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::transport::HttpClient;

const BADGE_UNLOCK: &str = "/computer-unlock";

/// Where a badge is in its unlock cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPhase {
    Idle,
    Submitting,
    Settled(Settlement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Success,
    Partial,
    Failure,
}

/// A machine the server reported as unlocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedMachine {
    pub id: MachineId,
    pub label: String,
    pub ip_address: String,
    pub log_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockReport {
    /// Server message, passed through for display.
    pub message: Option<String>,
    pub person: Option<String>,
    /// Machines the request was expected to unlock.
    pub requested: usize,
    pub unlocked: Vec<UnlockedMachine>,
    /// Descriptions of machines the server could not unlock.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked(UnlockReport),
    /// Some machines were unlocked and applied; the rest are described by
    /// `error`.
    Partial {
        report: UnlockReport,
        error: SyncError,
    },
    /// A request for the same badge was already in flight.
    Suppressed,
    Failed(SyncError),
}

impl UnlockOutcome {
    pub fn report(&self) -> Option<&UnlockReport> {
        match self {
            Self::Unlocked(report) | Self::Partial { report, .. } => Some(report),
            Self::Suppressed | Self::Failed(_) => None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked(_))
    }
}

#[derive(Debug, Deserialize)]
struct Person {
    #[serde(default)]
    name: Option<String>,
}

/// Body of a badge unlock response. Only `computers` is required for a
/// successful outcome; the counts are optional server hints.
#[derive(Debug, Deserialize)]
struct BadgeUnlockResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    computers: Vec<Value>,
    #[serde(default)]
    student: Option<Person>,
    #[serde(default, alias = "requested_count")]
    requested: Option<usize>,
    #[serde(default, alias = "assigned_count")]
    assigned: Option<usize>,
    #[serde(default)]
    failed: Vec<Value>,
}

#[derive(Debug, Default)]
struct ControllerState {
    phases: HashMap<String, UnlockPhase>,
    last_error: Option<String>,
}

/// Marks a badge as submitting and guarantees it leaves that phase, even
/// when the request future is dropped.
struct Submission {
    state: Rc<RefCell<ControllerState>>,
    badge: String,
    settled: bool,
}

impl Submission {
    fn settle(mut self, settlement: Settlement) {
        self.state
            .borrow_mut()
            .phases
            .insert(self.badge.clone(), UnlockPhase::Settled(settlement));
        self.settled = true;
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if !self.settled {
            self.state
                .borrow_mut()
                .phases
                .insert(self.badge.clone(), UnlockPhase::Idle);
        }
    }
}

/// Drives unlock requests and applies their outcomes to the sync context.
pub struct UnlockController<H> {
    http: Rc<H>,
    ctx: Rc<SyncContext>,
    state: Rc<RefCell<ControllerState>>,
}

impl<H> Clone for UnlockController<H> {
    fn clone(&self) -> Self {
        Self {
            http: Rc::clone(&self.http),
            ctx: Rc::clone(&self.ctx),
            state: Rc::clone(&self.state),
        }
    }
}

impl<H: HttpClient + 'static> UnlockController<H> {
    pub fn new(http: Rc<H>, ctx: Rc<SyncContext>) -> Self {
        Self {
            http,
            ctx,
            state: Rc::new(RefCell::new(ControllerState::default())),
        }
    }

    pub fn phase(&self, badge: &str) -> UnlockPhase {
        self.state
            .borrow()
            .phases
            .get(badge.trim())
            .copied()
            .unwrap_or(UnlockPhase::Idle)
    }

    /// User-facing message of the most recent failed or partial unlock,
    /// cleared by the next full success.
    pub fn last_error(&self) -> Option<String> {
        self.state.borrow().last_error.clone()
    }

    /// Forget settled phases and the last error. Submissions still in
    /// flight keep their phase.
    pub fn reset(&self) {
        let mut state = self.state.borrow_mut();
        state.phases.retain(|_, phase| *phase == UnlockPhase::Submitting);
        state.last_error = None;
    }

    /// Run [`Self::unlock_by_badge`] as a local task, so the outcome is
    /// applied even if the caller goes away. Must be called inside a
    /// `LocalSet`.
    pub fn spawn_badge(&self, rfid_uid: String) -> tokio::task::JoinHandle<UnlockOutcome> {
        let controller = self.clone();
        tokio::task::spawn_local(async move { controller.unlock_by_badge(&rfid_uid).await })
    }

    /// Unlock every machine assigned to the badge holder.
    pub async fn unlock_by_badge(&self, rfid_uid: &str) -> UnlockOutcome {
        let badge = rfid_uid.trim();
        if badge.is_empty() {
            return self.fail(SyncError::Validation {
                message: "Badge UID is empty.".to_string(),
            });
        }
        let Some(submission) = self.begin(badge) else {
            tracing::debug!(badge, "Badge already submitting, scan suppressed");
            return UnlockOutcome::Suppressed;
        };

        tracing::info!(badge, "Submitting badge unlock");
        let result = self
            .http
            .post(BADGE_UNLOCK, &json!({ "rfid_uid": badge }))
            .await;

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                submission.settle(Settlement::Failure);
                return self.fail(e.into());
            },
        };
        let response: BadgeUnlockResponse = match serde_json::from_value(body) {
            Ok(r) => r,
            Err(e) => {
                submission.settle(Settlement::Failure);
                return self.fail(SyncError::Decode(e.to_string()));
            },
        };

        let outcome = self.apply_badge_response(response);
        submission.settle(match &outcome {
            UnlockOutcome::Unlocked(_) => Settlement::Success,
            _ => Settlement::Partial,
        });
        outcome
    }

    /// Administrative unlock of one machine on behalf of a badge.
    pub async fn unlock_machine(&self, id: MachineId, rfid_uid: &str) -> UnlockOutcome {
        let path = format!("/computer/state/{id}");
        tracing::info!(machine = id, "Submitting direct unlock");
        let body = match self
            .http
            .put(&path, &json!({ "rfid_uid": rfid_uid.trim() }))
            .await
        {
            Ok(body) => body,
            Err(e) => return self.fail(e.into()),
        };

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        let records: Vec<&Value> = match (body.get("computers"), body.get("computer")) {
            (Some(Value::Array(list)), _) => list.iter().collect(),
            (_, Some(one @ Value::Object(_))) => vec![one],
            _ => Vec::new(),
        };

        let mut report = UnlockReport {
            message,
            requested: 1,
            ..UnlockReport::default()
        };
        if records.is_empty() {
            // No machine echoed back: the request itself is the confirmation
            report.unlocked.push(self.apply_unlock(id, None, None, None));
        } else {
            for value in records {
                match normalize_record(value) {
                    Ok(record) => {
                        let unlocked =
                            self.apply_unlock(record.id, Some(&record.patch), record.revision, None);
                        report.unlocked.push(unlocked);
                    },
                    Err(e) => report.failed.push(e.to_string()),
                }
            }
        }

        if report.unlocked.iter().any(|m| m.id == id) && report.failed.is_empty() {
            self.succeed(&report, "Computer unlocked successfully!");
            UnlockOutcome::Unlocked(report)
        } else {
            let error = SyncError::PartialOutcome {
                requested: 1,
                unlocked: usize::from(report.unlocked.iter().any(|m| m.id == id)),
                failed: report.failed.len().max(1),
            };
            self.partial(report, error)
        }
    }

    fn begin(&self, badge: &str) -> Option<Submission> {
        let mut state = self.state.borrow_mut();
        if state.phases.get(badge) == Some(&UnlockPhase::Submitting) {
            return None;
        }
        state
            .phases
            .insert(badge.to_string(), UnlockPhase::Submitting);
        Some(Submission {
            state: Rc::clone(&self.state),
            badge: badge.to_string(),
            settled: false,
        })
    }

    fn apply_badge_response(&self, response: BadgeUnlockResponse) -> UnlockOutcome {
        let person = response.student.and_then(|s| s.name);
        let observed_at = now_millis();
        let mut report = UnlockReport {
            message: response.message,
            person: person.clone(),
            ..UnlockReport::default()
        };

        // Result order: the last machine ends up at the front of the feed
        for (seq, value) in response.computers.iter().enumerate() {
            let record = match normalize_record(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "Unusable machine in unlock response");
                    report.failed.push(e.to_string());
                    continue;
                },
            };
            let log_id = value.get("log_id").and_then(Value::as_u64);
            let unlocked =
                self.apply_unlock(record.id, Some(&record.patch), record.revision, log_id);

            let scan_id = match log_id {
                Some(id) => ScanId::Server(id),
                None => ScanId::Local {
                    observed_at,
                    seq: local_seq(seq),
                },
            };
            let event = ScanEvent::new(
                scan_id,
                person.as_deref(),
                unlocked.label.clone(),
                unlocked.ip_address.clone(),
                observed_at,
            );
            if self.ctx.activity_mut().push(event) == PushResult::Duplicate {
                tracing::debug!(%scan_id, "Scan already in activity feed");
            }
            report.unlocked.push(unlocked);
        }
        report.failed.extend(response.failed.iter().map(describe_failed));

        let declared = response.requested.or(response.assigned).unwrap_or(0);
        report.requested = declared.max(report.unlocked.len() + report.failed.len());

        if report.unlocked.is_empty()
            || report.unlocked.len() < report.requested
            || !report.failed.is_empty()
        {
            let error = SyncError::PartialOutcome {
                requested: report.requested,
                unlocked: report.unlocked.len(),
                failed: report.failed.len(),
            };
            return self.partial(report, error);
        }

        self.succeed(&report, "Computers unlocked successfully!");
        UnlockOutcome::Unlocked(report)
    }

    /// Merge an unlock for `id` at a fresh client revision. Identity fields
    /// echoed by the server ride along so new machines get a label.
    fn apply_unlock(
        &self,
        id: MachineId,
        echoed: Option<&MachinePatch>,
        server_revision: Option<Revision>,
        log_id: Option<u64>,
    ) -> UnlockedMachine {
        if let Some(rev) = server_revision {
            self.ctx.observe(rev);
        }
        let mut patch = MachinePatch::unlocked();
        if let Some(echoed) = echoed {
            patch.ip_address = echoed.ip_address.clone();
            patch.number = echoed.number.clone();
        }
        let revision = self.ctx.next_revision();
        self.ctx.merge(id, &patch, revision);

        let mirror = self.ctx.mirror();
        let (label, ip_address) = mirror
            .get(id)
            .map(|m| (m.label(), m.ip_address.clone()))
            .unwrap_or_else(|| (format!("PC-{id}"), String::new()));
        UnlockedMachine {
            id,
            label,
            ip_address,
            log_id,
        }
    }

    fn succeed(&self, report: &UnlockReport, fallback: &str) {
        self.state.borrow_mut().last_error = None;
        let message = report.message.as_deref().unwrap_or(fallback);
        tracing::info!(unlocked = report.unlocked.len(), "Unlock succeeded");
        self.ctx.notifier().success(message);
    }

    fn partial(&self, report: UnlockReport, error: SyncError) -> UnlockOutcome {
        let message = error.user_message();
        tracing::warn!(
            requested = report.requested,
            unlocked = report.unlocked.len(),
            failed = report.failed.len(),
            "Unlock only partially succeeded"
        );
        self.state.borrow_mut().last_error = Some(message.clone());
        self.ctx.notifier().warning(&message);
        UnlockOutcome::Partial { report, error }
    }

    fn fail(&self, error: SyncError) -> UnlockOutcome {
        let message = error.user_message();
        tracing::warn!(error = %error, "Unlock failed");
        self.state.borrow_mut().last_error = Some(message.clone());
        self.ctx.notifier().error(&message);
        UnlockOutcome::Failed(error)
    }
}

fn describe_failed(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("message")
            .or_else(|| o.get("computer_number"))
            .or_else(|| o.get("id"))
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Position of a machine in the unlock response, saturating at `u32::MAX`.
fn local_seq(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}
