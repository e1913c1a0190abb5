use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Authorization,
    Clearing,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Authorization => write!(f, "AUTHORIZATION"),
            TransactionType::Clearing => write!(f, "CLEARING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Settled,
}

/// Audit-trail entry kinds. Processing events are written inside the same
/// database transaction as the ledger mutation they document; the
/// notification and analytics events are appended by post-commit listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionEventType {
    AuthorizationTransactionProcessed,
    ClearingTransactionProcessed,
    CardholderNotified,
    AnalyticsSent,
}

/// Canonical transaction record handed to the engine by the processor
/// adapter layer. One of these arrives per authorization and one per
/// clearing, linked by `(transaction_correlation_id, processor_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub authorization_transaction_id: String,
    pub clearing_transaction_id: Option<String>,
    pub transaction_correlation_id: String,
    pub processor_id: String,
    pub processor_name: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub billing_amount: BigDecimal,
    pub billing_currency: String,
    pub card_id: String,
    pub user_id: String,
    pub mcc: String,
    pub reference_number: String,
    pub metadata: Value,
    pub is_successful: bool,
}

/// Shallow union of two metadata bags; incoming keys win on conflict.
/// Anything that is not an object on both sides leaves the existing value
/// untouched.
pub fn merge_metadata(existing: &Value, incoming: &Value) -> Value {
    match (existing.as_object(), incoming.as_object()) {
        (Some(current), Some(update)) => {
            let mut merged = current.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => existing.clone(),
    }
}
