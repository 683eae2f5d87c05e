use serde::Deserialize;
use stellar_monitor_domain::model::{Cursor, RawLedgerEvent};

use crate::error::FetchError;

/// One page of new ledger events plus the position to resume from.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    /// Sorted by position, all strictly after the requested cursor.
    pub events: Vec<RawLedgerEvent>,
    pub next_cursor: Cursor,
    pub has_more: bool,
}

impl FetchedBatch {
    pub fn empty(cursor: Cursor) -> Self {
        Self {
            events: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HorizonPage<T> {
    #[serde(rename = "_embedded")]
    pub embedded: Embedded<T>,
}

#[derive(Debug, Deserialize)]
pub struct Embedded<T> {
    pub records: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct LedgerRecord {
    pub sequence: u32,
}

/// RFC 7807 problem document returned by Horizon on errors.
#[derive(Debug, Default, Deserialize)]
pub struct HorizonProblem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub extras: Option<ProblemExtras>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProblemExtras {
    #[serde(default)]
    pub invalid_field: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl HorizonProblem {
    pub fn concerns_cursor(&self) -> bool {
        self.extras
            .as_ref()
            .and_then(|extras| extras.invalid_field.as_deref())
            == Some("cursor")
    }

    pub fn describe(&self) -> String {
        let reason = self
            .extras
            .as_ref()
            .and_then(|extras| extras.reason.as_deref())
            .unwrap_or(&self.detail);
        if self.title.is_empty() {
            reason.to_string()
        } else {
            format!("{}: {}", self.title, reason)
        }
    }
}

/// Lifts one Horizon operation record into a [`RawLedgerEvent`].
///
/// Only the paging token is mandatory here: without it the record cannot be
/// placed in the stream at all. Every other field is checked by the
/// normalizer so a bad record is skipped instead of failing the page.
pub fn raw_event_from_record(record: serde_json::Value) -> Result<RawLedgerEvent, FetchError> {
    let token = record
        .get("paging_token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FetchError::FatalProtocol("operation record without paging_token".into()))?;
    let position: Cursor = token.parse().map_err(|err| {
        FetchError::FatalProtocol(format!("unparsable paging_token `{token}`: {err}"))
    })?;

    let text = |field: &str| {
        record
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
    };

    Ok(RawLedgerEvent {
        position,
        ledger_sequence: position.ledger_sequence(),
        transaction_hash: text("transaction_hash").unwrap_or_default(),
        operation_index: position.operation_index(),
        operation_type: text("type").unwrap_or_default(),
        source_account: text("source_account"),
        closed_at: text("created_at"),
        payload: record,
    })
}
