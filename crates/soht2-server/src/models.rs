//! API request and response models

use crate::history::{
    HistoryFilter, HistorySort, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MAX_SORT_KEYS,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use soht2_proto::ConnectionId;

/// Error body returned by every failing API call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// `POST /api/connection?host=..&port=..`
#[derive(Debug, Clone, Deserialize)]
pub struct OpenQuery {
    pub host: String,
    pub port: u16,
}

/// `GET /api/connection/history` query.
///
/// List parameters (`un`, `id`, `tp`, `sort`) may be repeated or given
/// comma-separated. Timestamps are UTC, either RFC 3339 or
/// `yyyy-MM-ddTHH:mm:ss`.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub filter: HistoryFilter,
    pub sort: Vec<HistorySort>,
    /// Zero-based page
    pub page: usize,
    pub size: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            filter: HistoryFilter::default(),
            sort: vec![HistorySort::DEFAULT],
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl HistoryQuery {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, String> {
        let mut query = HistoryQuery::default();
        let mut sort = Vec::new();

        for (key, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let items = move || value.split(',').map(str::trim).filter(|v| !v.is_empty());
            let filter = &mut query.filter;
            match key.as_str() {
                "un" => filter.usernames.extend(items().map(str::to_string)),
                "id" => {
                    for id in items() {
                        let id = id
                            .parse::<ConnectionId>()
                            .map_err(|_| format!("Invalid connection id '{}'", id))?;
                        filter.connection_ids.push(id);
                    }
                }
                "ch" => filter.client_host = Some(value.to_string()),
                "th" => filter.target_host = Some(value.to_string()),
                "tp" => {
                    for port in items() {
                        let port = port
                            .parse::<u16>()
                            .map_err(|_| format!("Invalid target port '{}'", port))?;
                        filter.target_ports.push(port);
                    }
                }
                "oa" => filter.opened_after = Some(parse_timestamp(value)?),
                "ob" => filter.opened_before = Some(parse_timestamp(value)?),
                "ca" => filter.closed_after = Some(parse_timestamp(value)?),
                "cb" => filter.closed_before = Some(parse_timestamp(value)?),
                "sort" => {
                    for item in items() {
                        let key = item.parse::<HistorySort>().map_err(|e| e.to_string())?;
                        if sort.iter().any(|s: &HistorySort| s.field == key.field) {
                            return Err(format!("Duplicate sort field in '{}'", item));
                        }
                        sort.push(key);
                    }
                }
                "pg" => {
                    query.page = value
                        .parse()
                        .map_err(|_| format!("Invalid page '{}'", value))?
                }
                "sz" => {
                    let size: usize = value
                        .parse()
                        .map_err(|_| format!("Invalid page size '{}'", value))?;
                    if size == 0 || size > MAX_PAGE_SIZE {
                        return Err(format!("Page size must be between 1 and {}", MAX_PAGE_SIZE));
                    }
                    query.size = size;
                }
                _ => {}
            }
        }

        if sort.len() > MAX_SORT_KEYS {
            return Err(format!("At most {} sort keys are allowed", MAX_SORT_KEYS));
        }
        if !sort.is_empty() {
            query.sort = sort;
        }
        Ok(query)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|ts| ts.and_utc())
        .map_err(|_| format!("Invalid timestamp '{}'", value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(query: &[(&str, &str)]) -> Vec<(String, String)> {
        query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_history_query_defaults() {
        let query = HistoryQuery::from_pairs(Vec::new()).unwrap();
        assert_eq!(query.size, 10);
        assert_eq!(query.page, 0);
        assert_eq!(query.sort, vec![HistorySort::DEFAULT]);
    }

    #[test]
    fn test_history_query_lists_and_windows() {
        let query = HistoryQuery::from_pairs(pairs(&[
            ("un", "user1,user2"),
            ("un", "admin"),
            ("tp", "22"),
            ("tp", "80,443"),
            ("ch", "10.0."),
            ("oa", "2025-01-01T10:00:00"),
            ("cb", "2025-01-02T00:00:00Z"),
            ("sort", "targetPort:asc,openedAt:desc"),
            ("pg", "2"),
            ("sz", "50"),
        ]))
        .unwrap();

        assert_eq!(query.filter.usernames, vec!["user1", "user2", "admin"]);
        assert_eq!(query.filter.target_ports, vec![22, 80, 443]);
        assert_eq!(query.filter.client_host.as_deref(), Some("10.0."));
        assert_eq!(
            query.filter.opened_after.unwrap().to_rfc3339(),
            "2025-01-01T10:00:00+00:00"
        );
        assert!(query.filter.closed_before.is_some());
        assert_eq!(query.sort.len(), 2);
        assert_eq!((query.page, query.size), (2, 50));
    }

    #[test]
    fn test_history_query_rejects_bad_values() {
        for bad in [
            ("tp", "http"),
            ("id", "not-a-uuid"),
            ("oa", "yesterday"),
            ("sort", "openedAt:sideways"),
            ("sort", "openedAt:asc,openedAt:desc"),
            ("sort", "userName:asc,targetHost:asc,targetPort:asc,openedAt:asc"),
            ("sz", "1001"),
            ("sz", "0"),
        ] {
            assert!(HistoryQuery::from_pairs(pairs(&[bad])).is_err(), "{:?}", bad);
        }
    }
}
