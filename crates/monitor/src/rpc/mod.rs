use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use stellar_monitor_domain::model::{Cursor, RawLedgerEvent};
use tracing::debug;

use crate::error::{FetchError, MonitorError};

mod types;

pub use types::{raw_event_from_record, FetchedBatch, HorizonProblem};

use types::{HorizonPage, LedgerRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only view of the ledger stream.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Returns up to `limit` events strictly after `cursor`, in position
    /// order.
    async fn fetch_since(&self, cursor: Cursor, limit: u32) -> Result<FetchedBatch, FetchError>;

    /// Cursor placed just after the most recently closed ledger.
    async fn latest_cursor(&self) -> Result<Cursor, FetchError>;
}

#[async_trait]
impl<T> LedgerSource for Arc<T>
where
    T: LedgerSource + ?Sized,
{
    async fn fetch_since(&self, cursor: Cursor, limit: u32) -> Result<FetchedBatch, FetchError> {
        (**self).fetch_since(cursor, limit).await
    }

    async fn latest_cursor(&self) -> Result<Cursor, FetchError> {
        (**self).latest_cursor().await
    }
}

/// [`LedgerSource`] backed by a Horizon server's REST API.
pub struct HorizonSource {
    client: Client,
    base_url: String,
}

impl HorizonSource {
    pub fn new(base_url: &str) -> Result<Self, MonitorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        cursor: Option<Cursor>,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(classify_failure(status, &body, cursor))
        }
    }
}

#[async_trait]
impl LedgerSource for HorizonSource {
    async fn fetch_since(&self, cursor: Cursor, limit: u32) -> Result<FetchedBatch, FetchError> {
        let query = [
            ("cursor", cursor.to_string()),
            ("order", "asc".to_string()),
            ("limit", limit.to_string()),
            ("include_failed", "false".to_string()),
        ];
        let body = self.get("/operations", &query, Some(cursor)).await?;
        let (events, page_len) = parse_operations_page(&body)?;
        debug!(%cursor, records = page_len, "fetched operations page");
        Ok(order_batch(cursor, events, page_len, limit))
    }

    async fn latest_cursor(&self) -> Result<Cursor, FetchError> {
        let query = [("order", "desc".to_string()), ("limit", "1".to_string())];
        let body = self.get("/ledgers", &query, None).await?;
        let page: HorizonPage<LedgerRecord> = serde_json::from_slice(&body)
            .map_err(|err| FetchError::FatalProtocol(format!("ledgers page: {err}")))?;
        let latest = page
            .embedded
            .records
            .first()
            .map(|ledger| ledger.sequence)
            .ok_or_else(|| FetchError::FatalProtocol("ledgers page is empty".into()))?;
        Ok(Cursor::ledger_start(latest.saturating_add(1)))
    }
}

/// Decodes an `/operations` page. Returns the events and the number of
/// records the server sent, which decides whether more pages follow.
pub fn parse_operations_page(body: &[u8]) -> Result<(Vec<RawLedgerEvent>, usize), FetchError> {
    let page: HorizonPage<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|err| FetchError::FatalProtocol(format!("operations page: {err}")))?;
    let records = page.embedded.records;
    let page_len = records.len();
    let events = records
        .into_iter()
        .map(raw_event_from_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((events, page_len))
}

/// Maps a non-success answer onto the fetch error taxonomy.
pub fn classify_failure(status: StatusCode, body: &[u8], cursor: Option<Cursor>) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return FetchError::Transient(format!("horizon answered {status}"));
    }

    let problem: HorizonProblem = serde_json::from_slice(body).unwrap_or_default();
    if let Some(cursor) = cursor {
        if (status == StatusCode::BAD_REQUEST && problem.concerns_cursor())
            || status == StatusCode::GONE
        {
            return FetchError::InvalidCursor {
                cursor: cursor.to_string(),
                reason: problem.describe(),
            };
        }
    }
    FetchError::FatalProtocol(format!("horizon answered {status}: {}", problem.describe()))
}

/// Enforces stream order on one page: drops records at or before the
/// requested cursor and repeated positions, then sorts what is left.
pub fn order_batch(
    requested: Cursor,
    mut events: Vec<RawLedgerEvent>,
    page_len: usize,
    limit: u32,
) -> FetchedBatch {
    events.retain(|event| event.position > requested);
    events.sort_by_key(|event| event.position);
    events.dedup_by_key(|event| event.position);

    let next_cursor = events
        .last()
        .map(|event| event.position)
        .unwrap_or(requested);
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);

    FetchedBatch {
        events,
        next_cursor,
        // A full page that did not move the cursor would be fetched forever.
        has_more: limit > 0 && page_len >= limit && next_cursor > requested,
    }
}
