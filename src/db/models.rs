use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{TransactionEventType, TransactionStatus, TransactionType};

/// One row per logical transaction. The clearing event mutates this row in
/// place; a second row for the same `(transaction_correlation_id,
/// processor_id)` can never exist.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub processor_id: String,
    pub processor_name: String,
    pub transaction_correlation_id: String,
    pub authorization_transaction_id: String,
    pub clearing_transaction_id: Option<String>,
    pub status: TransactionStatus,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub auth_amount: BigDecimal,
    pub clearing_amount: Option<BigDecimal>,
    pub currency: String,
    pub mcc: String,
    pub card_id: String,
    pub user_id: String,
    pub reference_number: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Running balance projection per card. All mutations happen under a
/// `FOR UPDATE` lock inside the reconciliation transaction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub card_id: String,
    pub user_id: String,
    pub credit_limit: BigDecimal,
    pub available_credit: BigDecimal,
    pub settled_balance: BigDecimal,
    pub pending_balance: BigDecimal,
    pub current_utilization: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// A card seen for the first time, initialized from the authorization
    /// that created it.
    pub fn new(
        card_id: String,
        user_id: String,
        credit_limit: BigDecimal,
        pending_balance: BigDecimal,
    ) -> Self {
        let mut card = Self {
            id: Uuid::new_v4(),
            card_id,
            user_id,
            credit_limit,
            available_credit: BigDecimal::from(0),
            settled_balance: BigDecimal::from(0),
            pending_balance,
            current_utilization: BigDecimal::from(0),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        card.recompute_derived();
        card
    }

    /// Recomputes `available_credit` and `current_utilization` from the
    /// balances. Must be called after every balance mutation, inside the
    /// same lock scope.
    pub fn recompute_derived(&mut self) {
        let committed = &self.pending_balance + &self.settled_balance;
        self.available_credit = &self.credit_limit - &committed;
        self.current_utilization = committed * BigDecimal::from(100) / &self.credit_limit;
    }
}

/// Buffered clearing event whose authorization has not arrived yet.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendingClearingTransaction {
    pub id: Uuid,
    pub processor_id: String,
    pub transaction_correlation_id: String,
    pub transaction_data: Value,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record. Never updated or deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event_type: TransactionEventType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Durable work-queue entry carrying one canonical transaction record.
/// Rows are retained after completion and terminal failure for inspection.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransactionJob {
    pub id: Uuid,
    pub dedup_key: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recurring-job registry entry; `next_run_at` is the source of truth for
/// when the job fires next.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobSchedule {
    pub name: String,
    pub cron_expr: String,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
