//! Paginated retrieval of a complete external listing.
//!
//! Every source paginates differently: page numbers with a `next` link, page
//! numbers with `page`/`pages` counters, a boolean `hasMore` flag, opaque
//! cursors, offsets. A [`PaginationDescriptor`] captures those differences as
//! data so one iterative loop, [`SourcePager::fetch_all`], serves every source.
//!
//! The pager is all-or-nothing: when any page fails, the pages fetched so far are
//! dropped and the error is returned. Callers rely on that to never reconcile
//! against an incomplete listing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SourceConnection;
use crate::contract::PageFetcher;
use crate::error::SyncError;
use crate::models::SourceRecord;
use crate::path;

/// How successive pages are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// Page numbers (`page=1`, `page=2`, ...).
    #[default]
    Page,
    /// Record offsets (`offset=0`, `offset=100`, ...).
    Offset,
    /// Opaque cursor taken from the previous response.
    Cursor,
    /// A single request returns everything.
    None,
}

/// The signal a response carries about further pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MoreSignal {
    /// A boolean at `path` (`hasMore`, `has_next`).
    Flag { path: String },
    /// Current and total page counters.
    PageCounters {
        current_path: String,
        total_path: String,
    },
    /// A non-empty next link/cursor at `path`.
    NextToken { path: String },
    /// A page shorter than the configured page size is the last one.
    ShortPage,
}

impl Default for MoreSignal {
    fn default() -> Self {
        MoreSignal::NextToken {
            path: "next".to_string(),
        }
    }
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_size_param() -> String {
    "limit".to_string()
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_first_page() -> u64 {
    1
}

fn default_id_path() -> String {
    "id".to_string()
}

fn default_max_pages() -> u32 {
    10_000
}

/// Capability descriptor of a source's pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationDescriptor {
    #[serde(default)]
    pub style: PaginationStyle,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_first_page")]
    pub first_page: u64,
    #[serde(default = "default_size_param")]
    pub size_param: String,
    /// Sent as `size_param` when set.
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    /// Dotted path to the record array; absent when the body itself is the array.
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub more: MoreSignal,
    /// Dotted path to the next cursor. Defaults to the `NextToken` path.
    #[serde(default)]
    pub cursor_path: Option<String>,
    /// Dotted path to the external identifier inside each record.
    #[serde(default = "default_id_path")]
    pub id_path: String,
    /// Upper bound on requests per listing; exceeding it fails the fetch.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for PaginationDescriptor {
    fn default() -> Self {
        Self {
            style: PaginationStyle::default(),
            page_param: default_page_param(),
            first_page: default_first_page(),
            size_param: default_size_param(),
            page_size: None,
            offset_param: default_offset_param(),
            cursor_param: default_cursor_param(),
            records_path: None,
            more: MoreSignal::default(),
            cursor_path: None,
            id_path: default_id_path(),
            max_pages: default_max_pages(),
        }
    }
}

/// Position of the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Page(u64),
    Offset(u64),
    Cursor(Option<String>),
    Single,
}

impl PaginationDescriptor {
    /// Rejects descriptors whose more-signal cannot drive their style.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Configuration` for cursor pagination without a
    /// cursor location and for short-page detection without a page size.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.style == PaginationStyle::Cursor && self.cursor_source().is_none() {
            return Err(SyncError::Configuration(
                "cursor pagination needs `cursor_path` or a next_token signal".to_string(),
            ));
        }
        if self.more == MoreSignal::ShortPage && self.page_size.is_none() {
            return Err(SyncError::Configuration(
                "short_page signal needs `page_size`".to_string(),
            ));
        }
        Ok(())
    }

    fn cursor_source(&self) -> Option<&str> {
        self.cursor_path.as_deref().or(match &self.more {
            MoreSignal::NextToken { path } => Some(path.as_str()),
            _ => None,
        })
    }

    fn start(&self) -> Position {
        match self.style {
            PaginationStyle::Page => Position::Page(self.first_page),
            PaginationStyle::Offset => Position::Offset(0),
            PaginationStyle::Cursor => Position::Cursor(None),
            PaginationStyle::None => Position::Single,
        }
    }

    fn query_for(&self, position: &Position, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut query = extra.to_vec();
        match position {
            Position::Page(page) => query.push((self.page_param.clone(), page.to_string())),
            Position::Offset(offset) => query.push((self.offset_param.clone(), offset.to_string())),
            Position::Cursor(Some(cursor)) => query.push((self.cursor_param.clone(), cursor.clone())),
            Position::Cursor(None) | Position::Single => {}
        }
        if let (Some(size), false) = (self.page_size, *position == Position::Single) {
            query.push((self.size_param.clone(), size.to_string()));
        }
        query
    }

    /// Extracts the record array from a decoded page.
    pub fn records<'a>(&self, body: &'a Value) -> Result<&'a Vec<Value>, SyncError> {
        let path = self.records_path.as_deref().unwrap_or("");
        match path::lookup(body, path) {
            Some(Value::Array(records)) => Ok(records),
            Some(_) => Err(SyncError::Fetch(format!(
                "records at `{}` are not an array",
                path
            ))),
            None => Err(SyncError::Fetch(format!(
                "response has no records at `{}`",
                path
            ))),
        }
    }

    /// Evaluates the more-pages signal for the page just fetched.
    ///
    /// Returns the next position, or `None` when the listing is complete. A
    /// response that cannot tell whether more pages follow, or announces more
    /// without a cursor to reach them, is an error: the listing would
    /// otherwise end early and look complete.
    fn next(
        &self,
        position: &Position,
        body: &Value,
        page_len: usize,
    ) -> Result<Option<Position>, SyncError> {
        if page_len == 0 || *position == Position::Single {
            return Ok(None);
        }

        let more = match &self.more {
            MoreSignal::Flag { path } => path::lookup(body, path).is_some_and(path::truthy),
            MoreSignal::PageCounters {
                current_path,
                total_path,
            } => {
                let current = path::lookup(body, current_path)
                    .and_then(as_u64)
                    .or(match position {
                        Position::Page(page) => Some(*page),
                        _ => None,
                    });
                let total = path::lookup(body, total_path).and_then(as_u64);
                match (current, total) {
                    (Some(c), Some(t)) => c < t,
                    _ => {
                        return Err(SyncError::Fetch(format!(
                            "response lacks page counters `{}`/`{}`",
                            current_path, total_path
                        )))
                    }
                }
            }
            MoreSignal::NextToken { path } => path::lookup(body, path).and_then(token).is_some(),
            MoreSignal::ShortPage => self
                .page_size
                .is_some_and(|size| page_len >= size as usize),
        };

        if !more {
            return Ok(None);
        }

        match position {
            Position::Page(page) => Ok(Some(Position::Page(page + 1))),
            Position::Offset(offset) => Ok(Some(Position::Offset(offset + page_len as u64))),
            Position::Cursor(_) => {
                let cursor_path = self.cursor_source().unwrap_or_default();
                match path::lookup(body, cursor_path).and_then(token) {
                    Some(cursor) => Ok(Some(Position::Cursor(Some(cursor)))),
                    None => Err(SyncError::Fetch(format!(
                        "response announces more pages but has no cursor at `{}`",
                        cursor_path
                    ))),
                }
            }
            Position::Single => Ok(None),
        }
    }
}

fn token(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accumulates a complete listing page by page.
#[derive(Clone)]
pub struct SourcePager {
    fetcher: Arc<dyn PageFetcher>,
}

impl SourcePager {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetches every page of `endpoint`, in order, and returns all records.
    ///
    /// Pages are requested strictly one after another since the more-pages
    /// signal depends on the previous response.
    ///
    /// # Errors
    ///
    /// Returns the first fetch error, discarding pages already accumulated.
    /// Returns `SyncError::Fetch` if the listing needs more than `max_pages`
    /// requests or a response has no record array.
    pub async fn fetch_all(
        &self,
        source: &SourceConnection,
        endpoint: &str,
        extra_query: &[(String, String)],
    ) -> Result<Vec<SourceRecord>, SyncError> {
        let descriptor = &source.pagination;
        descriptor.check()?;
        let mut records = Vec::new();
        let mut position = descriptor.start();
        let mut requests: u32 = 0;

        loop {
            if requests >= descriptor.max_pages {
                warn!(
                    source = %source.name,
                    endpoint,
                    max_pages = descriptor.max_pages,
                    "Listing exceeds page limit, discarding partial results"
                );
                return Err(SyncError::Fetch(format!(
                    "listing of {} exceeded {} pages",
                    endpoint, descriptor.max_pages
                )));
            }

            let query = descriptor.query_for(&position, extra_query);
            let body = self
                .fetcher
                .fetch_page(source, endpoint, &query)
                .await
                .inspect_err(|e| {
                    warn!(
                        source = %source.name,
                        endpoint,
                        page = requests + 1,
                        accumulated = records.len(),
                        error = %e,
                        "Page fetch failed, discarding partial results"
                    );
                })?;
            requests += 1;

            let page = descriptor.records(&body)?;
            let page_len = page.len();
            records.extend(
                page.iter()
                    .cloned()
                    .map(|r| SourceRecord::from_body(r, &descriptor.id_path)),
            );

            debug!(
                source = %source.name,
                endpoint,
                page = requests,
                page_len,
                total = records.len(),
                "Fetched page"
            );

            match descriptor.next(&position, &body, page_len).inspect_err(|e| {
                warn!(
                    source = %source.name,
                    endpoint,
                    page = requests,
                    error = %e,
                    "Cannot continue listing, discarding partial results"
                );
            })? {
                Some(next) => position = next,
                None => break,
            }
        }

        info!(
            source = %source.name,
            endpoint,
            pages = requests,
            records = records.len(),
            "Listing complete"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockPageFetcher;
    use mockall::Sequence;
    use serde_json::json;

    fn connection(pagination: PaginationDescriptor) -> SourceConnection {
        let mut source = SourceConnection::new("test", "https://source.example.org/");
        source.pagination = pagination;
        source
    }

    fn page_param(query: &[(String, String)], name: &str) -> Option<String> {
        query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[tokio::test]
    async fn test_three_pages_fetched_in_order() {
        let mut fetcher = MockPageFetcher::new();
        let mut seq = Sequence::new();
        for page in 1..=3u64 {
            fetcher
                .expect_fetch_page()
                .withf(move |_, endpoint, query| {
                    endpoint == "zaken" && page_param(query, "page") == Some(page.to_string())
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _, _| {
                    let next = if page < 3 { json!("more") } else { Value::Null };
                    Ok(json!({
                        "results": [
                            {"id": format!("r{}", page * 2 - 1)},
                            {"id": format!("r{}", page * 2)}
                        ],
                        "next": next
                    }))
                });
        }

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("results".into()),
            ..Default::default()
        });

        let records = pager.fetch_all(&source, "zaken", &[]).await.unwrap();
        let ids: Vec<_> = records
            .iter()
            .map(|r| r.external_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3", "r4", "r5", "r6"]);
    }

    #[tokio::test]
    async fn test_failure_on_second_page_discards_everything() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .withf(|_, _, query| page_param(query, "page").as_deref() == Some("1"))
            .times(1)
            .returning(|_, _, _| Ok(json!({"results": [{"id": 1}], "next": "p2"})));
        fetcher
            .expect_fetch_page()
            .withf(|_, _, query| page_param(query, "page").as_deref() == Some("2"))
            .times(1)
            .returning(|_, _, _| Err(SyncError::Fetch("HTTP 502".into())));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("results".into()),
            ..Default::default()
        });

        let err = pager.fetch_all(&source, "zaken", &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_page_counters_and_extra_query() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .withf(|_, _, query| page_param(query, "status").as_deref() == Some("open"))
            .times(2)
            .returning(|_, _, query| {
                let page: u64 = page_param(query, "page").unwrap().parse().unwrap();
                Ok(json!({
                    "data": {"items": [{"uuid": format!("u{}", page)}]},
                    "page": page,
                    "pages": 2
                }))
            });

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("data.items".into()),
            more: MoreSignal::PageCounters {
                current_path: "page".into(),
                total_path: "pages".into(),
            },
            id_path: "uuid".into(),
            ..Default::default()
        });

        let extra = vec![("status".to_string(), "open".to_string())];
        let records = pager.fetch_all(&source, "events", &extra).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].external_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_cursor_pagination_with_next_token() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(2)
            .returning(|_, _, query| match page_param(query, "cursor") {
                None => Ok(json!({"items": [{"id": "a"}], "next": "c1"})),
                Some(c) if c == "c1" => Ok(json!({"items": [{"id": "b"}], "next": null})),
                Some(other) => Err(SyncError::Fetch(format!("unexpected cursor {}", other))),
            });

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            style: PaginationStyle::Cursor,
            records_path: Some("items".into()),
            ..Default::default()
        });

        let records = pager.fetch_all(&source, "posts", &[]).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_pagination_with_flag_reads_cursor_path() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(2)
            .returning(|_, _, query| match page_param(query, "cursor") {
                None => Ok(json!({"items": [{"id": "a"}], "hasMore": true, "next": "c1"})),
                Some(c) if c == "c1" => Ok(json!({"items": [{"id": "b"}], "hasMore": false})),
                Some(other) => Err(SyncError::Fetch(format!("unexpected cursor {}", other))),
            });

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            style: PaginationStyle::Cursor,
            records_path: Some("items".into()),
            more: MoreSignal::Flag {
                path: "hasMore".into(),
            },
            cursor_path: Some("next".into()),
            ..Default::default()
        });

        let records = pager.fetch_all(&source, "posts", &[]).await.unwrap();
        let ids: Vec<_> = records.iter().filter_map(|r| r.external_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_more_pages_without_cursor_fails_the_listing() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _, _| Ok(json!({"items": [{"id": "a"}], "hasMore": true})));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            style: PaginationStyle::Cursor,
            records_path: Some("items".into()),
            more: MoreSignal::Flag {
                path: "hasMore".into(),
            },
            cursor_path: Some("next".into()),
            ..Default::default()
        });

        let err = pager.fetch_all(&source, "posts", &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(ref msg) if msg.contains("no cursor at `next`")));
    }

    #[tokio::test]
    async fn test_offset_without_page_counter_fails_the_listing() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _, _| Ok(json!({"items": [{"id": 1}], "pages": 4})));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            style: PaginationStyle::Offset,
            records_path: Some("items".into()),
            more: MoreSignal::PageCounters {
                current_path: "page".into(),
                total_path: "pages".into(),
            },
            ..Default::default()
        });

        let err = pager.fetch_all(&source, "events", &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(ref msg) if msg.contains("page counters")));
    }

    #[test]
    fn test_check_rejects_undrivable_descriptors() {
        let cursor_with_flag = PaginationDescriptor {
            style: PaginationStyle::Cursor,
            more: MoreSignal::Flag {
                path: "hasMore".into(),
            },
            ..Default::default()
        };
        assert!(matches!(
            cursor_with_flag.check(),
            Err(SyncError::Configuration(_))
        ));

        let short_page_without_size = PaginationDescriptor {
            style: PaginationStyle::Offset,
            more: MoreSignal::ShortPage,
            ..Default::default()
        };
        assert!(short_page_without_size.check().is_err());

        let cursor_with_token = PaginationDescriptor {
            style: PaginationStyle::Cursor,
            ..Default::default()
        };
        assert!(cursor_with_token.check().is_ok());
    }

    #[tokio::test]
    async fn test_offset_short_page_terminates() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(2)
            .returning(|_, _, query| {
                assert_eq!(page_param(query, "limit").as_deref(), Some("2"));
                match page_param(query, "offset").as_deref() {
                    Some("0") => Ok(json!([{"id": 1}, {"id": 2}])),
                    Some("2") => Ok(json!([{"id": 3}])),
                    other => Err(SyncError::Fetch(format!("unexpected offset {:?}", other))),
                }
            });

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            style: PaginationStyle::Offset,
            page_size: Some(2),
            more: MoreSignal::ShortPage,
            ..Default::default()
        });

        let records = pager.fetch_all(&source, "events", &[]).await.unwrap();
        let ids: Vec<_> = records.iter().filter_map(|r| r.external_id.clone()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_empty_page_terminates_even_if_flag_set() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _, _| Ok(json!({"items": [], "hasMore": true})));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("items".into()),
            more: MoreSignal::Flag {
                path: "hasMore".into(),
            },
            ..Default::default()
        });

        assert!(pager.fetch_all(&source, "x", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_pages_guard() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(3)
            .returning(|_, _, _| Ok(json!({"items": [{"id": "same"}], "hasMore": true})));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("items".into()),
            more: MoreSignal::Flag {
                path: "hasMore".into(),
            },
            max_pages: 3,
            ..Default::default()
        });

        let err = pager.fetch_all(&source, "x", &[]).await.unwrap_err();
        assert!(err.to_string().contains("exceeded 3 pages"));
    }

    #[tokio::test]
    async fn test_missing_records_key_is_fetch_error() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .returning(|_, _, _| Ok(json!({"error": "maintenance"})));

        let pager = SourcePager::new(Arc::new(fetcher));
        let source = connection(PaginationDescriptor {
            records_path: Some("results".into()),
            ..Default::default()
        });

        let err = pager.fetch_all(&source, "x", &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
        assert!(err.aborts_run());
    }

    #[test]
    fn test_single_request_style() {
        let descriptor = PaginationDescriptor {
            style: PaginationStyle::None,
            page_size: Some(50),
            ..Default::default()
        };
        let position = descriptor.start();
        assert!(descriptor.query_for(&position, &[]).is_empty());
        assert_eq!(descriptor.next(&position, &json!([]), 10).unwrap(), None);
    }
}
