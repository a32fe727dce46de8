//! Machine and laboratory listing plus machine administration.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use labgate_core::events::normalize_record;
use labgate_core::machine::{MachineId, MachineState, MachineStatus};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::transport::HttpClient;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Laboratory {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Fields submitted when creating or editing a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineDraft {
    pub ip_address: String,
    pub computer_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub laboratory_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MachineStatus>,
}

impl MachineDraft {
    fn check(&self) -> Result<(), SyncError> {
        if self.ip_address.trim().is_empty() || self.computer_number.trim().is_empty() {
            return Err(SyncError::Validation {
                message: "IP address and computer number are required.".to_string(),
            });
        }
        Ok(())
    }
}

/// Bulk machine refresh and machine administration.
pub struct MachineDirectory<H> {
    http: Rc<H>,
    ctx: Rc<SyncContext>,
}

impl<H> Clone for MachineDirectory<H> {
    fn clone(&self) -> Self {
        Self {
            http: Rc::clone(&self.http),
            ctx: Rc::clone(&self.ctx),
        }
    }
}

impl<H: HttpClient> MachineDirectory<H> {
    pub fn new(http: Rc<H>, ctx: Rc<SyncContext>) -> Self {
        Self { http, ctx }
    }

    /// Replace the mirror with the server's full machine list. Returns the
    /// number of machines loaded.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        let body = self
            .http
            .get("/computers", &[("include", "laboratory".to_string())])
            .await?;
        let machines = self.states_from(&body, "computers")?;
        let count = machines.len();
        self.ctx.mirror_mut().replace_all(machines);
        tracing::debug!(count, "Machine list refreshed");
        Ok(count)
    }

    /// Machines with no laboratory. Does not touch the mirror.
    pub async fn unassigned(&self) -> Result<Vec<MachineState>, SyncError> {
        let body = self.http.get("/computers/null-lab", &[]).await?;
        self.states_from(&body, "computers")
    }

    pub async fn laboratories(&self) -> Result<Vec<Laboratory>, SyncError> {
        let body = self.http.get("/laboratories", &[]).await?;
        let list = list_at(&body, "laboratories")?;
        list.iter()
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| SyncError::Decode(e.to_string()))
            })
            .collect()
    }

    pub async fn create(&self, draft: &MachineDraft) -> Result<(), SyncError> {
        let result = match draft.check() {
            Ok(()) => self.submit_post("/computers", &json!(draft)).await,
            Err(e) => Err(e),
        };
        self.finish(result, "Computer added successfully!", "Failed to add computer.")
            .await
    }

    pub async fn update(&self, id: MachineId, draft: &MachineDraft) -> Result<(), SyncError> {
        let result = match draft.check() {
            Ok(()) => self
                .http
                .put(&format!("/computers/update/{id}"), &json!(draft))
                .await
                .map_err(SyncError::from),
            Err(e) => Err(e),
        };
        self.finish(
            result,
            "Computer updated successfully!",
            "Failed to update computer.",
        )
        .await
    }

    /// Delete a machine and evict it from the mirror.
    pub async fn remove(&self, id: MachineId) -> Result<(), SyncError> {
        let result = self
            .http
            .delete(&format!("/computers/{id}"))
            .await
            .map_err(SyncError::from);
        if result.is_ok() {
            self.ctx.mirror_mut().remove(id);
        }
        self.finish(
            result,
            "Computer deleted successfully!",
            "Failed to delete computer.",
        )
        .await
    }

    /// Assign a laboratory to several machines at once.
    pub async fn assign_laboratory(
        &self,
        machine_ids: &[MachineId],
        laboratory_id: u64,
    ) -> Result<(), SyncError> {
        let body = json!({ "computer_ids": machine_ids, "laboratory_id": laboratory_id });
        let result = self.submit_post("/assign-laboratories", &body).await;
        self.finish(
            result,
            "Lab assigned to computer successfully!",
            "Failed to assign lab to computer.",
        )
        .await
    }

    async fn submit_post(&self, path: &str, body: &Value) -> Result<Value, SyncError> {
        self.http.post(path, body).await.map_err(SyncError::from)
    }

    /// Notify the outcome of a mutation and resync the mirror after a
    /// success. Validation messages from the server are shown verbatim.
    async fn finish(
        &self,
        result: Result<Value, SyncError>,
        success: &str,
        failure: &str,
    ) -> Result<(), SyncError> {
        match result {
            Ok(body) => {
                let message = body.get("message").and_then(Value::as_str).unwrap_or(success);
                self.ctx.notifier().success(message);
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "Refresh after machine change failed");
                }
                Ok(())
            },
            Err(e) => {
                tracing::warn!(error = %e, "{failure}");
                match &e {
                    SyncError::Validation { message } => self.ctx.notifier().error(message),
                    _ => self.ctx.notifier().error(failure),
                }
                Err(e)
            },
        }
    }

    /// Machine states from a listing. Records carry their own revision when
    /// the server sends one. The rest share the highest revision known once
    /// the listing has been read, so any later push still wins over them.
    fn states_from(&self, body: &Value, key: &str) -> Result<Vec<MachineState>, SyncError> {
        let list = list_at(body, key)?;
        let mut records = Vec::with_capacity(list.len());
        for value in list {
            match normalize_record(value) {
                Ok(record) => {
                    if let Some(rev) = record.revision {
                        self.ctx.observe(rev);
                    }
                    records.push(record);
                },
                Err(e) => tracing::warn!(error = %e, "Skipping malformed machine record"),
            }
        }
        let floor = self.ctx.last_revision();
        Ok(records
            .into_iter()
            .map(|r| MachineState::from_patch(r.id, &r.patch, r.revision.unwrap_or(floor)))
            .collect())
    }
}

/// The array under `key`, or the body itself when it is already an array.
fn list_at<'a>(body: &'a Value, key: &str) -> Result<&'a [Value], SyncError> {
    match body {
        Value::Array(list) => Ok(list),
        Value::Null => Err(SyncError::Decode(format!("empty body, expected `{key}`"))),
        _ => match body.get(key) {
            Some(Value::Array(list)) => Ok(list),
            Some(Value::Null) => Ok(&[]),
            _ => Err(SyncError::Decode(format!("missing `{key}` list"))),
        },
    }
}
