use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Default page size used by the access-log views.
pub const DEFAULT_PER_PAGE: u32 = 7;

/// Page metadata of a paged collection, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub current_page: u32,
    pub last_page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            current_page: 1,
            last_page: 1,
            per_page: DEFAULT_PER_PAGE,
            total: 0,
        }
    }
}

impl Pagination {
    /// Bring server metadata into range: `last_page` is at least 1 and
    /// `current_page` lies in `[1, last_page]`.
    pub fn normalized(self) -> Self {
        let last_page = self.last_page.max(1);
        Self {
            current_page: self.current_page.clamp(1, last_page),
            last_page,
            ..self
        }
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.last_page
    }

    pub fn has_previous(&self) -> bool {
        self.current_page > 1
    }
}

/// Filter applied to a paged query. Changing any field starts a new query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageQuery {
    pub search: String,
    /// `None` means every status.
    pub status: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl PageQuery {
    /// Query-string pairs for the non-empty parts of this query.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        let search = self.search.trim();
        if !search.is_empty() {
            pairs.push(("search", search.to_string()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(from) = self.date_from {
            pairs.push(("from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.date_to {
            pairs.push(("to", to.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

/// Handle for one in-flight page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    serial: u64,
    page: u32,
}

impl FetchTicket {
    pub fn page(&self) -> u32 {
        self.page
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    OutOfRange { requested: u32, last_page: u32 },
    /// The fetch was issued for a query or page that is no longer current.
    Superseded { page: u32 },
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange {
                requested,
                last_page,
            } => write!(f, "page {requested} is outside 1..={last_page}"),
            Self::Superseded { page } => write!(f, "result for page {page} was superseded"),
        }
    }
}

impl std::error::Error for PageError {}

/// Page position of one paged view plus the query it belongs to.
///
/// Every fetch is tagged with a [`FetchTicket`]; only the most recently
/// issued ticket may apply its result, so a slow response for an old query
/// or page never overwrites newer metadata.
#[derive(Debug)]
pub struct PageCursor {
    query: PageQuery,
    pagination: Pagination,
    generation: u64,
    serial: u64,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::new(DEFAULT_PER_PAGE)
    }
}

impl PageCursor {
    pub fn new(per_page: u32) -> Self {
        Self {
            query: PageQuery::default(),
            pagination: Pagination {
                per_page: per_page.max(1),
                ..Pagination::default()
            },
            generation: 0,
            serial: 0,
        }
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn current_page(&self) -> u32 {
        self.pagination.current_page
    }

    pub fn query(&self) -> &PageQuery {
        &self.query
    }

    /// Switch to a new query. Returns `true` and resets to page 1 if the
    /// query changed; an identical query is a no-op.
    pub fn set_query(&mut self, query: PageQuery) -> bool {
        if query == self.query {
            return false;
        }
        self.query = query;
        self.generation += 1;
        self.pagination.current_page = 1;
        true
    }

    /// Ticket for fetching page `n`. Pages outside `[1, last_page]` are
    /// rejected. The current page only moves once the fetched result is
    /// applied.
    pub fn go_to_page(&mut self, n: u32) -> Result<FetchTicket, PageError> {
        if n < 1 || n > self.pagination.last_page {
            return Err(PageError::OutOfRange {
                requested: n,
                last_page: self.pagination.last_page,
            });
        }
        Ok(self.begin_fetch(n))
    }

    /// Ticket for fetching `page` of the current query. Issuing a ticket
    /// supersedes every earlier one.
    pub fn begin_fetch(&mut self, page: u32) -> FetchTicket {
        self.serial += 1;
        FetchTicket {
            generation: self.generation,
            serial: self.serial,
            page: page.max(1),
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation && ticket.serial == self.serial
    }

    /// Apply server metadata for `ticket`. Results for superseded tickets
    /// are discarded.
    pub fn apply(&mut self, ticket: &FetchTicket, pagination: Pagination) -> Result<(), PageError> {
        if !self.is_current(ticket) {
            return Err(PageError::Superseded { page: ticket.page });
        }
        self.pagination = pagination.normalized();
        Ok(())
    }

    /// Back to page 1 of an empty query.
    pub fn reset(&mut self) {
        let per_page = self.pagination.per_page;
        self.query = PageQuery::default();
        self.generation += 1;
        self.pagination = Pagination {
            per_page,
            ..Pagination::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_pages() -> Pagination {
        Pagination {
            current_page: 2,
            last_page: 3,
            per_page: 7,
            total: 21,
        }
    }

    #[test]
    fn page_two_of_three() {
        let mut cursor = PageCursor::new(7);
        let ticket = cursor.begin_fetch(2);
        cursor.apply(&ticket, three_pages()).unwrap();
        let p = cursor.pagination();
        assert_eq!((p.current_page, p.last_page, p.total), (2, 3, 21));

        // Beyond the last page: rejected, not applied as 4
        assert_eq!(
            cursor.go_to_page(4),
            Err(PageError::OutOfRange {
                requested: 4,
                last_page: 3
            })
        );
        assert_eq!(cursor.current_page(), 2);
        assert!(cursor.go_to_page(0).is_err());
        assert_eq!(cursor.current_page(), 2);

        let ticket = cursor.go_to_page(3).unwrap();
        assert_eq!(ticket.page(), 3);
        // Not moved until the page arrives
        assert_eq!(cursor.current_page(), 2);
        cursor
            .apply(
                &ticket,
                Pagination {
                    current_page: 3,
                    ..three_pages()
                },
            )
            .unwrap();
        assert_eq!(cursor.current_page(), 3);
    }

    #[test]
    fn query_change_resets_to_first_page() {
        let mut cursor = PageCursor::new(7);
        let t = cursor.begin_fetch(2);
        cursor.apply(&t, three_pages()).unwrap();

        let changed = cursor.set_query(PageQuery {
            search: "ada".to_string(),
            ..PageQuery::default()
        });
        assert!(changed);
        assert_eq!(cursor.current_page(), 1);

        // Same query again is a no-op
        assert!(!cursor.set_query(cursor.query().clone()));
    }

    #[test]
    fn superseded_query_result_is_discarded() {
        let mut cursor = PageCursor::new(7);
        let old = cursor.begin_fetch(1);
        cursor.set_query(PageQuery {
            status: Some("locked".to_string()),
            ..PageQuery::default()
        });
        let new = cursor.begin_fetch(1);

        assert_eq!(
            cursor.apply(&old, three_pages()),
            Err(PageError::Superseded { page: 1 })
        );
        assert_eq!(cursor.pagination().total, 0);

        let fresh = Pagination {
            current_page: 1,
            last_page: 1,
            per_page: 7,
            total: 4,
        };
        cursor.apply(&new, fresh).unwrap();
        assert_eq!(cursor.pagination().total, 4);
    }

    #[test]
    fn slower_page_response_loses_to_newer_request() {
        let mut cursor = PageCursor::new(7);
        let first = cursor.begin_fetch(1);
        cursor.apply(&first, three_pages()).unwrap();

        let page_two = cursor.go_to_page(2).unwrap();
        let page_three = cursor.go_to_page(3).unwrap();
        assert!(cursor.apply(&page_two, three_pages()).is_err());
        let p3 = Pagination {
            current_page: 3,
            ..three_pages()
        };
        cursor.apply(&page_three, p3).unwrap();
        assert_eq!(cursor.current_page(), 3);
    }

    #[test]
    fn server_metadata_is_clamped() {
        let p = Pagination {
            current_page: 9,
            last_page: 3,
            per_page: 7,
            total: 21,
        }
        .normalized();
        assert_eq!(p.current_page, 3);

        let empty = Pagination {
            current_page: 0,
            last_page: 0,
            per_page: 7,
            total: 0,
        }
        .normalized();
        assert_eq!((empty.current_page, empty.last_page), (1, 1));
    }

    #[test]
    fn pagination_from_laravel_meta() {
        let json = r#"{"current_page":2,"last_page":3,"per_page":7,"total":21,"from":8,"to":14}"#;
        let p: Pagination = serde_json::from_str(json).unwrap();
        assert_eq!(p, three_pages());
        assert!(p.has_next());
        assert!(p.has_previous());
    }

    #[test]
    fn query_pairs_skip_empty_parts() {
        assert!(PageQuery::default().to_pairs().is_empty());
        let q = PageQuery {
            search: " ada ".to_string(),
            status: None,
            date_from: NaiveDate::from_ymd_opt(2025, 3, 1),
            date_to: None,
        };
        assert_eq!(
            q.to_pairs(),
            vec![
                ("search", "ada".to_string()),
                ("from", "2025-03-01".to_string())
            ]
        );
    }

    #[test]
    fn reset_keeps_page_size() {
        let mut cursor = PageCursor::new(25);
        let t = cursor.begin_fetch(1);
        cursor
            .apply(
                &t,
                Pagination {
                    current_page: 1,
                    last_page: 4,
                    per_page: 25,
                    total: 90,
                },
            )
            .unwrap();
        cursor.reset();
        assert_eq!(cursor.pagination().per_page, 25);
        assert_eq!(cursor.pagination().last_page, 1);
        assert!(!cursor.is_current(&t));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn go_to_page_stays_in_range(
                last_page in 1u32..50,
                requests in proptest::collection::vec(0u32..60, 1..30)
            ) {
                let mut cursor = PageCursor::new(7);
                let t = cursor.begin_fetch(1);
                cursor.apply(&t, Pagination { current_page: 1, last_page, per_page: 7, total: 0 }).unwrap();
                for n in requests {
                    let _ = cursor.go_to_page(n);
                    let current = cursor.current_page();
                    prop_assert!(current >= 1 && current <= last_page);
                }
            }
        }
    }
}
