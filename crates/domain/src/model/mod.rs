//! Canonical ledger event model shared by the monitor pipeline and its
//! consumers.

mod cursor;

use std::fmt;

use chrono::{DateTime, Utc};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub use cursor::{Cursor, CursorParseError, InitialCursor};

/// Version of the [`NormalizedEvent`] layout handed to consumers.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Returns `true` when an event produced under `version` can be read by this
/// build.
pub fn is_schema_compatible(version: u32) -> bool {
    version <= EVENT_SCHEMA_VERSION
}

/// Stable identifier of a ledger operation, independent of when or how often
/// it is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministically derives the SHA3-256 event id from the transaction hash
/// and the operation's index inside that transaction.
pub fn derive_event_id(transaction_hash: &str, operation_index: u32) -> EventId {
    let mut hasher = Sha3_256::new();
    hasher.update(transaction_hash.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(operation_index.to_be_bytes());
    EventId(hex_encode(hasher.finalize()))
}

/// Name under which a consumer is registered with the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventKind {
    Payment,
    PathPayment,
    AccountCreated,
    AccountMerged,
    Trustline,
    Offer,
    ContractInvocation,
    Other,
}

/// Token-level effect observed inside a contract invocation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BalanceChangeKind {
    Transfer,
    Mint,
    Burn,
    Clawback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "asset_type", rename_all = "snake_case")]
pub enum Asset {
    Native,
    Credit { code: String, issuer: String },
    /// Pool shares, only seen on trustline operations.
    LiquidityPool { pool_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub kind: BalanceChangeKind,
    pub from: Option<String>,
    pub to: Option<String>,
    pub asset: Asset,
    /// Amount in stroops.
    pub amount: i64,
}

/// Kind-specific content of a normalized event. Amounts are in stroops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetails {
    Payment {
        from: String,
        to: String,
        asset: Asset,
        amount: i64,
    },
    PathPayment {
        from: String,
        to: String,
        asset: Asset,
        amount: i64,
        source_asset: Asset,
        source_amount: i64,
    },
    AccountCreated {
        funder: String,
        account: String,
        starting_balance: i64,
    },
    AccountMerged {
        account: String,
        into: String,
    },
    Trustline {
        trustor: String,
        asset: Asset,
        limit: Option<i64>,
    },
    Offer {
        seller: String,
        selling: Asset,
        buying: Asset,
        amount: i64,
        price: String,
    },
    ContractInvocation {
        function: Option<String>,
        balance_changes: Vec<BalanceChange>,
    },
    Other {
        operation_type: String,
    },
}

impl EventDetails {
    pub fn kind(&self) -> EventKind {
        match self {
            EventDetails::Payment { .. } => EventKind::Payment,
            EventDetails::PathPayment { .. } => EventKind::PathPayment,
            EventDetails::AccountCreated { .. } => EventKind::AccountCreated,
            EventDetails::AccountMerged { .. } => EventKind::AccountMerged,
            EventDetails::Trustline { .. } => EventKind::Trustline,
            EventDetails::Offer { .. } => EventKind::Offer,
            EventDetails::ContractInvocation { .. } => EventKind::ContractInvocation,
            EventDetails::Other { .. } => EventKind::Other,
        }
    }

    /// Every account the event touches, used by account interest filters.
    pub fn accounts(&self) -> Vec<&str> {
        match self {
            EventDetails::Payment { from, to, .. } | EventDetails::PathPayment { from, to, .. } => {
                vec![from.as_str(), to.as_str()]
            }
            EventDetails::AccountCreated {
                funder, account, ..
            } => vec![funder.as_str(), account.as_str()],
            EventDetails::AccountMerged { account, into } => vec![account.as_str(), into.as_str()],
            EventDetails::Trustline { trustor, .. } => vec![trustor.as_str()],
            EventDetails::Offer { seller, .. } => vec![seller.as_str()],
            EventDetails::ContractInvocation {
                balance_changes, ..
            } => balance_changes
                .iter()
                .flat_map(|change| [change.from.as_deref(), change.to.as_deref()])
                .flatten()
                .collect(),
            EventDetails::Other { .. } => Vec::new(),
        }
    }
}

/// Operation record as fetched from the ledger data source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLedgerEvent {
    pub position: Cursor,
    pub ledger_sequence: u32,
    pub transaction_hash: String,
    pub operation_index: u32,
    pub operation_type: String,
    pub source_account: Option<String>,
    /// RFC 3339 close time of the ledger, as reported by the source.
    pub closed_at: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: EventId,
    pub ledger_sequence: u32,
    pub position: Cursor,
    pub transaction_hash: String,
    pub kind: EventKind,
    /// Account that submitted the operation.
    pub account: Option<String>,
    pub details: EventDetails,
    pub closed_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl NormalizedEvent {
    pub fn involves_account(&self, account: &str) -> bool {
        self.account.as_deref() == Some(account) || self.details.accounts().contains(&account)
    }
}

/// Number of decimal places Stellar amounts carry.
pub const STROOP_DECIMALS: usize = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount `{0}` is not a decimal number")]
    NotDecimal(String),
    #[error("amount `{0}` has more than {STROOP_DECIMALS} decimal places")]
    TooPrecise(String),
    #[error("amount `{0}` overflows i64 stroops")]
    Overflow(String),
}

/// Parses a Horizon decimal amount such as `"12.5000000"` into stroops.
pub fn parse_stroops(value: &str) -> Result<i64, AmountError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::NotDecimal(trimmed.to_string()));
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::NotDecimal(trimmed.to_string()));
    }
    if fraction.len() > STROOP_DECIMALS {
        return Err(AmountError::TooPrecise(trimmed.to_string()));
    }

    let overflow = || AmountError::Overflow(trimmed.to_string());
    let whole: i64 = whole.parse().map_err(|_| overflow())?;
    let mut fraction_stroops: i64 = 0;
    if !fraction.is_empty() {
        fraction_stroops = fraction.parse().map_err(|_| overflow())?;
        fraction_stroops *= 10_i64.pow((STROOP_DECIMALS - fraction.len()) as u32);
    }
    let stroops = whole
        .checked_mul(10_i64.pow(STROOP_DECIMALS as u32))
        .and_then(|value| value.checked_add(fraction_stroops))
        .ok_or_else(overflow)?;

    Ok(if negative { -stroops } else { stroops })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TX_HASH: &str = "3389e9f0f1a65f19736cacf544c2e825313e8447f569233bb8db39aa607c8889";

    #[test]
    fn event_id_is_deterministic() {
        let left = derive_event_id(TX_HASH, 1);
        let right = derive_event_id(TX_HASH, 1);
        assert_eq!(left, right);
        assert_eq!(left.as_str().len(), 64);
    }

    #[test]
    fn event_id_ignores_hash_case_but_not_index() {
        let lower = derive_event_id(TX_HASH, 1);
        let upper = derive_event_id(&TX_HASH.to_ascii_uppercase(), 1);
        assert_eq!(lower, upper);
        assert_ne!(lower, derive_event_id(TX_HASH, 2));
    }

    #[test]
    fn parses_horizon_amounts() {
        assert_eq!(parse_stroops("10.0000000"), Ok(100_000_000));
        assert_eq!(parse_stroops("0.0000001"), Ok(1));
        assert_eq!(parse_stroops("12.5"), Ok(125_000_000));
        assert_eq!(parse_stroops("7"), Ok(70_000_000));
        assert_eq!(parse_stroops("-1.5"), Ok(-15_000_000));
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert_eq!(parse_stroops(""), Err(AmountError::Empty));
        assert!(matches!(parse_stroops("1.2.3"), Err(AmountError::NotDecimal(_))));
        assert!(matches!(parse_stroops("abc"), Err(AmountError::NotDecimal(_))));
        assert!(matches!(
            parse_stroops("1.00000001"),
            Err(AmountError::TooPrecise(_))
        ));
        assert!(matches!(
            parse_stroops("99999999999999999999"),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn schema_versions_are_backward_compatible_only() {
        assert!(is_schema_compatible(EVENT_SCHEMA_VERSION));
        assert!(is_schema_compatible(0));
        assert!(!is_schema_compatible(EVENT_SCHEMA_VERSION + 1));
    }

    #[test]
    fn event_kind_parses_snake_case() {
        assert_eq!("payment".parse::<EventKind>(), Ok(EventKind::Payment));
        assert_eq!(
            "Account_Created".parse::<EventKind>(),
            Ok(EventKind::AccountCreated)
        );
        assert_eq!(EventKind::ContractInvocation.as_ref(), "contract_invocation");
    }

    #[test]
    fn contract_invocation_lists_counterparties() {
        let details = EventDetails::ContractInvocation {
            function: Some("transfer".into()),
            balance_changes: vec![BalanceChange {
                kind: BalanceChangeKind::Mint,
                from: None,
                to: Some("GDEST".into()),
                asset: Asset::Native,
                amount: 5,
            }],
        };
        assert_eq!(details.accounts(), vec!["GDEST"]);
        assert_eq!(details.kind(), EventKind::ContractInvocation);
    }
}
