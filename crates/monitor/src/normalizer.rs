use chrono::{DateTime, Utc};
use serde_json::Value;
use stellar_monitor_domain::model::{
    derive_event_id, parse_stroops, Asset, BalanceChange, BalanceChangeKind, EventDetails,
    NormalizedEvent, RawLedgerEvent, EVENT_SCHEMA_VERSION,
};

use crate::error::NormalizeError;

/// Converts a raw operation record into the canonical event, stamping it
/// with the current time as `observed_at`.
pub fn normalize(raw: &RawLedgerEvent) -> Result<NormalizedEvent, NormalizeError> {
    normalize_at(raw, Utc::now())
}

/// Deterministic variant of [`normalize`]: the same record and observation
/// time always produce the same event.
pub fn normalize_at(
    raw: &RawLedgerEvent,
    observed_at: DateTime<Utc>,
) -> Result<NormalizedEvent, NormalizeError> {
    let record = Record {
        raw,
        payload: &raw.payload,
    };

    let transaction_hash = raw.transaction_hash.trim();
    if transaction_hash.len() != 64 || !transaction_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(record.malformed(format!(
            "transaction hash `{transaction_hash}` is not 32 hex-encoded bytes"
        )));
    }
    let operation_type = raw.operation_type.trim();
    if operation_type.is_empty() {
        return Err(record.malformed("operation type is empty"));
    }
    let closed_at = raw
        .closed_at
        .as_deref()
        .ok_or_else(|| record.malformed("close time is missing"))
        .and_then(|value| {
            DateTime::parse_from_rfc3339(value)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|err| record.malformed(format!("close time `{value}`: {err}")))
        })?;

    let details = record.details(operation_type)?;

    Ok(NormalizedEvent {
        event_id: derive_event_id(transaction_hash, raw.operation_index),
        ledger_sequence: raw.ledger_sequence,
        position: raw.position,
        transaction_hash: transaction_hash.to_ascii_lowercase(),
        kind: details.kind(),
        account: raw.source_account.clone(),
        details,
        closed_at,
        observed_at,
        schema_version: EVENT_SCHEMA_VERSION,
    })
}

struct Record<'a> {
    raw: &'a RawLedgerEvent,
    payload: &'a Value,
}

impl Record<'_> {
    fn malformed(&self, reason: impl Into<String>) -> NormalizeError {
        NormalizeError::MalformedEvent {
            position: self.raw.position,
            reason: reason.into(),
        }
    }

    fn details(&self, operation_type: &str) -> Result<EventDetails, NormalizeError> {
        let details = match operation_type {
            "payment" => EventDetails::Payment {
                from: self.text("from")?,
                to: self.text("to")?,
                asset: self.asset("")?,
                amount: self.amount("amount")?,
            },
            "path_payment_strict_send" | "path_payment_strict_receive" => {
                EventDetails::PathPayment {
                    from: self.text("from")?,
                    to: self.text("to")?,
                    asset: self.asset("")?,
                    amount: self.amount("amount")?,
                    source_asset: self.asset("source_")?,
                    source_amount: self.amount("source_amount")?,
                }
            }
            "create_account" => EventDetails::AccountCreated {
                funder: self.text("funder")?,
                account: self.text("account")?,
                starting_balance: self.amount("starting_balance")?,
            },
            "account_merge" => EventDetails::AccountMerged {
                account: self.text("account")?,
                into: self.text("into")?,
            },
            "change_trust" | "allow_trust" | "set_trust_line_flags" => EventDetails::Trustline {
                trustor: self.text("trustor")?,
                asset: self.asset("")?,
                limit: self.optional_amount("limit")?,
            },
            "manage_sell_offer" | "manage_buy_offer" | "create_passive_sell_offer" => {
                EventDetails::Offer {
                    seller: self
                        .raw
                        .source_account
                        .clone()
                        .ok_or_else(|| self.malformed("offer without source account"))?,
                    selling: self.asset("selling_")?,
                    buying: self.asset("buying_")?,
                    amount: self.amount("amount")?,
                    price: self.text("price")?,
                }
            }
            "invoke_host_function" => EventDetails::ContractInvocation {
                function: self.optional_text("function"),
                balance_changes: self.balance_changes()?,
            },
            other => EventDetails::Other {
                operation_type: other.to_string(),
            },
        };
        Ok(details)
    }

    fn optional_text(&self, field: &str) -> Option<String> {
        field_text(self.payload, field)
    }

    fn text(&self, field: &str) -> Result<String, NormalizeError> {
        self.optional_text(field)
            .ok_or_else(|| self.malformed(format!("missing field `{field}`")))
    }

    fn amount(&self, field: &str) -> Result<i64, NormalizeError> {
        let value = self.text(field)?;
        parse_stroops(&value).map_err(|err| self.malformed(format!("`{field}`: {err}")))
    }

    fn optional_amount(&self, field: &str) -> Result<Option<i64>, NormalizeError> {
        match self.optional_text(field) {
            Some(value) => parse_stroops(&value)
                .map(Some)
                .map_err(|err| self.malformed(format!("`{field}`: {err}"))),
            None => Ok(None),
        }
    }

    fn asset(&self, prefix: &str) -> Result<Asset, NormalizeError> {
        parse_asset(self.payload, prefix).map_err(|reason| self.malformed(reason))
    }

    fn balance_changes(&self) -> Result<Vec<BalanceChange>, NormalizeError> {
        let Some(changes) = self.payload.get("asset_balance_changes") else {
            return Ok(Vec::new());
        };
        let Some(changes) = changes.as_array() else {
            if changes.is_null() {
                return Ok(Vec::new());
            }
            return Err(self.malformed("`asset_balance_changes` is not a list"));
        };

        changes
            .iter()
            .enumerate()
            .map(|(index, change)| {
                let at = |reason: String| self.malformed(format!("balance change {index}: {reason}"));
                let kind = field_text(change, "type")
                    .ok_or_else(|| at("missing `type`".into()))?
                    .parse::<BalanceChangeKind>()
                    .map_err(|err| at(err.to_string()))?;
                let amount = field_text(change, "amount")
                    .ok_or_else(|| at("missing `amount`".into()))
                    .and_then(|value| parse_stroops(&value).map_err(|err| at(err.to_string())))?;
                Ok(BalanceChange {
                    kind,
                    from: field_text(change, "from"),
                    to: field_text(change, "to"),
                    asset: parse_asset(change, "").map_err(at)?,
                    amount,
                })
            })
            .collect()
    }
}

fn field_text(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

fn parse_asset(value: &Value, prefix: &str) -> Result<Asset, String> {
    let type_field = format!("{prefix}asset_type");
    let asset_type =
        field_text(value, &type_field).ok_or_else(|| format!("missing field `{type_field}`"))?;
    match asset_type.as_str() {
        "native" => Ok(Asset::Native),
        "credit_alphanum4" | "credit_alphanum12" => {
            let code_field = format!("{prefix}asset_code");
            let issuer_field = format!("{prefix}asset_issuer");
            Ok(Asset::Credit {
                code: field_text(value, &code_field)
                    .ok_or_else(|| format!("missing field `{code_field}`"))?,
                issuer: field_text(value, &issuer_field)
                    .ok_or_else(|| format!("missing field `{issuer_field}`"))?,
            })
        }
        "liquidity_pool_shares" => Ok(Asset::LiquidityPool {
            pool_id: field_text(value, "liquidity_pool_id")
                .ok_or_else(|| "missing field `liquidity_pool_id`".to_string())?,
        }),
        other => Err(format!("unknown asset type `{other}`")),
    }
}
