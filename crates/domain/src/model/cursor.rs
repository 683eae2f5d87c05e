use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LEDGER_SHIFT: u32 = 32;
const TX_ORDER_SHIFT: u32 = 12;
const TX_ORDER_MASK: u64 = 0xF_FFFF;
const OP_INDEX_MASK: u64 = 0xFFF;

/// Position in the ledger stream, encoded the way Horizon encodes paging
/// tokens: `ledger << 32 | tx_order << 12 | op_index`.
///
/// Ordering of cursors matches ledger order, so comparing two cursors is
/// enough to decide which one is further along the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor(u64);

impl Cursor {
    pub const GENESIS: Cursor = Cursor(0);

    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn from_parts(ledger: u32, tx_order: u32, op_index: u32) -> Self {
        Self(
            (u64::from(ledger) << LEDGER_SHIFT)
                | ((u64::from(tx_order) & TX_ORDER_MASK) << TX_ORDER_SHIFT)
                | (u64::from(op_index) & OP_INDEX_MASK),
        )
    }

    /// Cursor positioned before the first operation of `ledger`.
    pub fn ledger_start(ledger: u32) -> Self {
        Self::from_parts(ledger, 0, 0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn ledger_sequence(&self) -> u32 {
        (self.0 >> LEDGER_SHIFT) as u32
    }

    pub fn transaction_order(&self) -> u32 {
        ((self.0 >> TX_ORDER_SHIFT) & TX_ORDER_MASK) as u32
    }

    pub fn operation_index(&self) -> u32 {
        (self.0 & OP_INDEX_MASK) as u32
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CursorParseError::Empty);
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| CursorParseError::NotNumeric(trimmed.to_string()))
    }
}

impl From<Cursor> for String {
    fn from(value: Cursor) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Cursor {
    type Error = CursorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorParseError {
    #[error("cursor is empty")]
    Empty,
    #[error("cursor `{0}` is not a numeric paging token")]
    NotNumeric(String),
    #[error("ledger sequence `{0}` is not a valid u32")]
    InvalidLedger(String),
}

/// Where a monitor with no persisted cursor starts reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum InitialCursor {
    /// Resolve the current chain head when the monitor first starts.
    Now,
    At(Cursor),
}

impl Default for InitialCursor {
    fn default() -> Self {
        Self::Now
    }
}

impl fmt::Display for InitialCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialCursor::Now => f.write_str("now"),
            InitialCursor::At(cursor) => write!(f, "{cursor}"),
        }
    }
}

impl FromStr for InitialCursor {
    type Err = CursorParseError;

    /// Accepts `now`, `ledger:<sequence>` or a raw paging token.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(Self::Now);
        }
        if let Some(ledger) = trimmed.strip_prefix("ledger:") {
            let sequence = ledger
                .trim()
                .parse::<u32>()
                .map_err(|_| CursorParseError::InvalidLedger(ledger.to_string()))?;
            return Ok(Self::At(Cursor::ledger_start(sequence)));
        }
        trimmed.parse().map(Self::At)
    }
}

impl From<InitialCursor> for String {
    fn from(value: InitialCursor) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for InitialCursor {
    type Error = CursorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
