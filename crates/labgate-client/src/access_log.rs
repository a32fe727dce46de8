//! Paged access-log history.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use labgate_core::activity::UNKNOWN_PERSON;
use labgate_core::events::parse_revision;
use labgate_core::pagination::{FetchTicket, PageCursor, PageQuery, Pagination};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::transport::HttpClient;

const LOGS: &str = "/logs";

/// One row of the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub id: u64,
    pub person: String,
    pub machine_label: Option<String>,
    pub ip_address: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AccessLogEntry {
    /// Parse one log row. Rows without an id are skipped by the caller.
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value.get("id").and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })?;
        let computer = value.get("computer");
        let student = value.get("student");

        let person = student
            .and_then(|s| s.get("name"))
            .or_else(|| value.get("student_name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_PERSON)
            .to_string();
        let machine_label = computer
            .and_then(|c| c.get("computer_number"))
            .or_else(|| value.get("computer_number"))
            .and_then(|n| match n {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .map(|n| format!("PC-{n}"));
        let ip_address = computer
            .and_then(|c| c.get("ip_address"))
            .or_else(|| value.get("ip_address"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let status = ["status", "action"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        Some(Self {
            id,
            person,
            machine_label,
            ip_address,
            status,
            started_at: timestamp(value, &["start_time", "time_in", "created_at"]),
            ended_at: timestamp(value, &["end_time", "time_out"]),
        })
    }
}

fn timestamp(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(parse_revision))
        .and_then(|rev| DateTime::from_timestamp_millis(i64::try_from(rev.get()).ok()?))
}

/// Current page of the access log plus its cursor.
#[derive(Debug, Default)]
pub struct AccessLogView {
    entries: Vec<AccessLogEntry>,
    cursor: PageCursor,
}

impl AccessLogView {
    pub fn new(per_page: u32) -> Self {
        Self {
            entries: Vec::new(),
            cursor: PageCursor::new(per_page),
        }
    }

    pub fn entries(&self) -> &[AccessLogEntry] {
        &self.entries
    }

    pub fn pagination(&self) -> Pagination {
        self.cursor.pagination()
    }

    pub fn query(&self) -> &PageQuery {
        self.cursor.query()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.cursor.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Loaded { page: u32, entries: usize },
    /// A newer query or page request was issued while this one was in
    /// flight; its result was dropped.
    Superseded,
    /// The query did not change; nothing was fetched.
    Unchanged,
}

/// Fetches access-log pages into the context's [`AccessLogView`].
pub struct AccessLogPager<H> {
    http: Rc<H>,
    ctx: Rc<SyncContext>,
}

impl<H> Clone for AccessLogPager<H> {
    fn clone(&self) -> Self {
        Self {
            http: Rc::clone(&self.http),
            ctx: Rc::clone(&self.ctx),
        }
    }
}

impl<H: HttpClient> AccessLogPager<H> {
    pub fn new(http: Rc<H>, ctx: Rc<SyncContext>) -> Self {
        Self { http, ctx }
    }

    /// Fetch `page` of the current query, whatever the known page range.
    pub async fn fetch_page(&self, page: u32) -> Result<PageOutcome, SyncError> {
        let ticket = self.ctx.access_log_mut().cursor.begin_fetch(page);
        self.fetch(ticket).await
    }

    /// Move to page `n`. Out-of-range pages are rejected without a request.
    pub async fn go_to_page(&self, n: u32) -> Result<PageOutcome, SyncError> {
        let ticket = self.ctx.access_log_mut().cursor.go_to_page(n)?;
        self.fetch(ticket).await
    }

    /// Re-fetch the current page.
    pub async fn refresh(&self) -> Result<PageOutcome, SyncError> {
        let page = self.ctx.access_log().pagination().current_page;
        self.fetch_page(page).await
    }

    /// Apply a new filter and load its first page.
    pub async fn set_query(&self, query: PageQuery) -> Result<PageOutcome, SyncError> {
        if !self.ctx.access_log_mut().cursor.set_query(query) {
            return Ok(PageOutcome::Unchanged);
        }
        self.fetch_page(1).await
    }

    async fn fetch(&self, ticket: FetchTicket) -> Result<PageOutcome, SyncError> {
        let mut params = self.ctx.access_log().query().to_pairs();
        params.push(("page", ticket.page().to_string()));

        let body = match self.http.get(LOGS, &params).await {
            Ok(body) => body,
            Err(e) => {
                let err = SyncError::from(e);
                tracing::warn!(page = ticket.page(), error = %err, "Failed to fetch access logs");
                self.ctx.notifier().error("Failed to fetch access logs");
                return Err(err);
            },
        };
        let (entries, pagination) = parse_page(&body, ticket.page())?;

        let mut view = self.ctx.access_log_mut();
        if view.cursor.apply(&ticket, pagination).is_err() {
            tracing::debug!(page = ticket.page(), "Dropping superseded access-log page");
            return Ok(PageOutcome::Superseded);
        }
        let count = entries.len();
        view.entries = entries;
        Ok(PageOutcome::Loaded {
            page: view.cursor.current_page(),
            entries: count,
        })
    }
}

/// Split a `{computer_logs: {data, meta}}` body. Pagination fields may also
/// sit directly beside `data`.
fn parse_page(
    body: &Value,
    requested: u32,
) -> Result<(Vec<AccessLogEntry>, Pagination), SyncError> {
    let logs = body
        .get("computer_logs")
        .ok_or_else(|| SyncError::Decode("missing `computer_logs`".to_string()))?;
    let rows = logs
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Decode("missing `computer_logs.data`".to_string()))?;

    let entries: Vec<_> = rows.iter().filter_map(AccessLogEntry::from_json).collect();
    if entries.len() < rows.len() {
        tracing::warn!(
            skipped = rows.len() - entries.len(),
            "Access-log rows without an id were skipped"
        );
    }

    let meta = logs.get("meta").unwrap_or(logs);
    let pagination = serde_json::from_value::<Pagination>(meta.clone()).unwrap_or(Pagination {
        current_page: requested,
        ..Pagination::default()
    });
    Ok((entries, pagination))
}
