//! Closed connection history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soht2_proto::{ConnectionId, Soht2Connection};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Largest page `search` will return
pub const MAX_PAGE_SIZE: usize = 1000;
/// Page size used when the caller asks for none
pub const DEFAULT_PAGE_SIZE: usize = 10;
/// Most sort keys one search accepts
pub const MAX_SORT_KEYS: usize = 3;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History storage error: {0}")]
    Storage(String),

    #[error("Invalid sort '{0}', expected <field>:<asc|desc>")]
    InvalidSort(String),
}

/// Receives the final metadata of every closed connection.
///
/// Failures are logged by the caller and never fail the close itself.
pub trait HistorySink: Send + Sync {
    fn add_history(&self, connection: Soht2Connection) -> Result<(), HistoryError>;
}

/// History search filter. Empty lists and `None` match everything; time
/// bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Exact usernames, case-insensitive
    pub usernames: Vec<String>,
    pub connection_ids: Vec<ConnectionId>,
    /// Client host substring, case-insensitive
    pub client_host: Option<String>,
    /// Target host substring, case-insensitive
    pub target_host: Option<String>,
    pub target_ports: Vec<u16>,
    pub opened_after: Option<DateTime<Utc>>,
    pub opened_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,
}

fn contains_ignore_case(text: &str, part: &str) -> bool {
    text.to_lowercase().contains(&part.to_lowercase())
}

impl HistoryFilter {
    fn matches(&self, c: &Soht2Connection) -> bool {
        let username_ok = self.usernames.is_empty()
            || self
                .usernames
                .iter()
                .any(|u| c.user.username.eq_ignore_ascii_case(u));
        let id_ok = self.connection_ids.is_empty() || self.connection_ids.contains(&c.id);
        let client_ok = self
            .client_host
            .as_deref()
            .map_or(true, |h| contains_ignore_case(&c.client_host, h));
        let target_ok = self
            .target_host
            .as_deref()
            .map_or(true, |h| contains_ignore_case(&c.target_host, h));
        let port_ok = self.target_ports.is_empty() || self.target_ports.contains(&c.target_port);

        let opened_ok = self.opened_after.map_or(true, |t| c.opened_at >= t)
            && self.opened_before.map_or(true, |t| c.opened_at <= t);
        let closed_ok = self
            .closed_after
            .map_or(true, |t| c.closed_at.is_some_and(|closed| closed >= t))
            && self
                .closed_before
                .map_or(true, |t| c.closed_at.is_some_and(|closed| closed <= t));

        username_ok && id_ok && client_ok && target_ok && port_ok && opened_ok && closed_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    UserName,
    ConnectionId,
    ClientHost,
    TargetHost,
    TargetPort,
    OpenedAt,
    ClosedAt,
    BytesRead,
    BytesWritten,
}

impl SortField {
    fn as_str(&self) -> &'static str {
        match self {
            SortField::UserName => "userName",
            SortField::ConnectionId => "connectionId",
            SortField::ClientHost => "clientHost",
            SortField::TargetHost => "targetHost",
            SortField::TargetPort => "targetPort",
            SortField::OpenedAt => "openedAt",
            SortField::ClosedAt => "closedAt",
            SortField::BytesRead => "bytesRead",
            SortField::BytesWritten => "bytesWritten",
        }
    }

    fn compare(&self, a: &Soht2Connection, b: &Soht2Connection) -> Ordering {
        match self {
            SortField::UserName => a.user.username.cmp(&b.user.username),
            SortField::ConnectionId => a.id.cmp(&b.id),
            SortField::ClientHost => a.client_host.cmp(&b.client_host),
            SortField::TargetHost => a.target_host.cmp(&b.target_host),
            SortField::TargetPort => a.target_port.cmp(&b.target_port),
            SortField::OpenedAt => a.opened_at.cmp(&b.opened_at),
            SortField::ClosedAt => a.closed_at.cmp(&b.closed_at),
            SortField::BytesRead => a.bytes_read.cmp(&b.bytes_read),
            SortField::BytesWritten => a.bytes_written.cmp(&b.bytes_written),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort key, written `field:asc` or `field:desc` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl HistorySort {
    pub const fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Newest connections first
    pub const DEFAULT: HistorySort = HistorySort::new(SortField::OpenedAt, SortDirection::Desc);

    fn compare(&self, a: &Soht2Connection, b: &Soht2Connection) -> Ordering {
        let ordering = self.field.compare(a, b);
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

impl FromStr for HistorySort {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HistoryError::InvalidSort(s.to_string());
        let (field, direction) = s.trim().split_once(':').ok_or_else(invalid)?;
        let field = [
            SortField::UserName,
            SortField::ConnectionId,
            SortField::ClientHost,
            SortField::TargetHost,
            SortField::TargetPort,
            SortField::OpenedAt,
            SortField::ClosedAt,
            SortField::BytesRead,
            SortField::BytesWritten,
        ]
        .into_iter()
        .find(|f| f.as_str() == field)
        .ok_or_else(invalid)?;
        let direction = match direction {
            "asc" => SortDirection::Asc,
            "desc" => SortDirection::Desc,
            _ => return Err(invalid()),
        };
        Ok(Self::new(field, direction))
    }
}

impl fmt::Display for HistorySort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        write!(f, "{}:{}", self.field.as_str(), direction)
    }
}

/// One page of history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<Soht2Connection>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub sort: Vec<HistorySort>,
}

/// Bounded in-memory history; the oldest entries are evicted first
#[derive(Debug)]
pub struct InMemoryHistory {
    entries: Mutex<VecDeque<Soht2Connection>>,
    capacity: usize,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_PAGE_SIZE))),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Page through entries accepted by both `filter` and `visible`, ordered
    /// by `sort` (newest first when empty). Ties keep the newest entry first.
    pub fn search<F>(
        &self,
        filter: &HistoryFilter,
        sort: &[HistorySort],
        visible: F,
        page: usize,
        size: usize,
    ) -> HistoryPage
    where
        F: Fn(&Soht2Connection) -> bool,
    {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let sort = if sort.is_empty() {
            vec![HistorySort::DEFAULT]
        } else {
            sort.iter().take(MAX_SORT_KEYS).copied().collect()
        };
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut matching: Vec<&Soht2Connection> = entries
            .iter()
            .rev()
            .filter(|c| filter.matches(c) && visible(c))
            .collect();
        matching.sort_by(|a, b| {
            sort.iter()
                .map(|key| key.compare(a, b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        HistoryPage {
            total: matching.len(),
            entries: matching
                .into_iter()
                .skip(page.saturating_mul(size))
                .take(size)
                .cloned()
                .collect(),
            page,
            size,
            sort,
        }
    }
}

impl HistorySink for InMemoryHistory {
    fn add_history(&self, connection: Soht2Connection) -> Result<(), HistoryError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(connection);
        Ok(())
    }
}
