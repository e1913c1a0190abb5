use bigdecimal::BigDecimal;
use sqlx::{PgPool, Postgres, Result, Transaction as SqlxTransaction};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::models::{Card, PendingClearingTransaction, Transaction, TransactionEvent};
use crate::domain::{TransactionDetails, TransactionEventType, TransactionStatus, TransactionType};

// --- Transaction queries ---

/// Atomic find-or-create on `(transaction_correlation_id, processor_id)`.
/// Returns the new row, or `None` when one already existed (duplicate
/// delivery). Relies on the unique index, not a read-then-write.
pub async fn insert_transaction_if_absent(
    executor: &mut SqlxTransaction<'_, Postgres>,
    details: &TransactionDetails,
) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (
            id, processor_id, processor_name, transaction_correlation_id,
            authorization_transaction_id, status, type, auth_amount,
            currency, mcc, card_id, user_id, reference_number, metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (transaction_correlation_id, processor_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&details.processor_id)
    .bind(&details.processor_name)
    .bind(&details.transaction_correlation_id)
    .bind(&details.authorization_transaction_id)
    .bind(details.status)
    .bind(TransactionType::Authorization)
    .bind(&details.billing_amount)
    .bind(&details.billing_currency)
    .bind(&details.mcc)
    .bind(&details.card_id)
    .bind(&details.user_id)
    .bind(&details.reference_number)
    .bind(&details.metadata)
    .fetch_optional(&mut **executor)
    .await
}

pub async fn find_transaction_for_update(
    executor: &mut SqlxTransaction<'_, Postgres>,
    transaction_correlation_id: &str,
    processor_id: &str,
) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE transaction_correlation_id = $1 AND processor_id = $2
        FOR UPDATE
        "#,
    )
    .bind(transaction_correlation_id)
    .bind(processor_id)
    .fetch_optional(&mut **executor)
    .await
}

/// Applies the clearing mutation to an existing, locked transaction row.
pub async fn settle_transaction(
    executor: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
    clearing_amount: &BigDecimal,
    clearing_transaction_id: Option<&str>,
    metadata: &Value,
) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>(
        r#"
        UPDATE transactions
        SET clearing_amount = $2,
            clearing_transaction_id = $3,
            status = $4,
            type = $5,
            metadata = $6,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(clearing_amount)
    .bind(clearing_transaction_id)
    .bind(TransactionStatus::Settled)
    .bind(TransactionType::Clearing)
    .bind(metadata)
    .fetch_one(&mut **executor)
    .await
}

pub async fn get_transaction(pool: &PgPool, id: Uuid) -> Result<Option<Transaction>> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_transactions(
    pool: &PgPool,
    card_id: Option<&str>,
    processor_id: Option<&str>,
    status: Option<TransactionStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Transaction>> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE ($1::text IS NULL OR card_id = $1)
          AND ($2::text IS NULL OR processor_id = $2)
          AND ($3::text IS NULL OR status = $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(card_id)
    .bind(processor_id)
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count_transactions(
    pool: &PgPool,
    card_id: Option<&str>,
    processor_id: Option<&str>,
    status: Option<TransactionStatus>,
) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM transactions
        WHERE ($1::text IS NULL OR card_id = $1)
          AND ($2::text IS NULL OR processor_id = $2)
          AND ($3::text IS NULL OR status = $3)
        "#,
    )
    .bind(card_id)
    .bind(processor_id)
    .bind(status)
    .fetch_one(pool)
    .await
}

// --- Card queries ---

/// Find-or-create guarded by the unique constraint on `card_id`. Under a
/// race the losing insert returns `None` and the caller falls through to
/// the locked read.
pub async fn insert_card_if_absent(
    executor: &mut SqlxTransaction<'_, Postgres>,
    card: &Card,
) -> Result<Option<Card>> {
    sqlx::query_as::<_, Card>(
        r#"
        INSERT INTO cards (
            id, card_id, user_id, credit_limit, available_credit,
            settled_balance, pending_balance, current_utilization
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (card_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(card.id)
    .bind(&card.card_id)
    .bind(&card.user_id)
    .bind(&card.credit_limit)
    .bind(&card.available_credit)
    .bind(&card.settled_balance)
    .bind(&card.pending_balance)
    .bind(&card.current_utilization)
    .fetch_optional(&mut **executor)
    .await
}

pub async fn find_card_for_update(
    executor: &mut SqlxTransaction<'_, Postgres>,
    card_id: &str,
) -> Result<Option<Card>> {
    sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE card_id = $1 FOR UPDATE")
        .bind(card_id)
        .fetch_optional(&mut **executor)
        .await
}

pub async fn update_card_balances(
    executor: &mut SqlxTransaction<'_, Postgres>,
    card: &Card,
) -> Result<Card> {
    sqlx::query_as::<_, Card>(
        r#"
        UPDATE cards
        SET pending_balance = $2,
            settled_balance = $3,
            available_credit = $4,
            current_utilization = $5,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(card.id)
    .bind(&card.pending_balance)
    .bind(&card.settled_balance)
    .bind(&card.available_credit)
    .bind(&card.current_utilization)
    .fetch_one(&mut **executor)
    .await
}

// --- Pending clearing buffer queries ---

pub async fn insert_pending_clearing_if_absent(
    executor: &mut SqlxTransaction<'_, Postgres>,
    details: &TransactionDetails,
    transaction_data: &Value,
    expires_at: DateTime<Utc>,
) -> Result<Option<PendingClearingTransaction>> {
    sqlx::query_as::<_, PendingClearingTransaction>(
        r#"
        INSERT INTO pending_clearing_transactions (
            id, processor_id, transaction_correlation_id,
            transaction_data, retry_count, expires_at
        ) VALUES ($1, $2, $3, $4, 0, $5)
        ON CONFLICT (transaction_correlation_id, processor_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&details.processor_id)
    .bind(&details.transaction_correlation_id)
    .bind(transaction_data)
    .bind(expires_at)
    .fetch_optional(&mut **executor)
    .await
}

pub async fn find_pending_clearing_for_update(
    executor: &mut SqlxTransaction<'_, Postgres>,
    transaction_correlation_id: &str,
    processor_id: &str,
) -> Result<Option<PendingClearingTransaction>> {
    sqlx::query_as::<_, PendingClearingTransaction>(
        r#"
        SELECT * FROM pending_clearing_transactions
        WHERE transaction_correlation_id = $1 AND processor_id = $2
        FOR UPDATE
        "#,
    )
    .bind(transaction_correlation_id)
    .bind(processor_id)
    .fetch_optional(&mut **executor)
    .await
}

pub async fn delete_pending_clearing(
    executor: &mut SqlxTransaction<'_, Postgres>,
    id: Uuid,
) -> Result<()> {
    sqlx::query("DELETE FROM pending_clearing_transactions WHERE id = $1")
        .bind(id)
        .execute(&mut **executor)
        .await?;
    Ok(())
}

/// Runs on the pool, not the replay transaction: the bump must survive the
/// rollback of a failed replay.
pub async fn bump_pending_clearing_retry(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE pending_clearing_transactions
        SET retry_count = retry_count + 1,
            last_retry_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// A row consumed by replay no longer matches the predicate, so the sweep
/// is safe to run concurrently with replay.
pub async fn delete_expired_pending_clearing(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM pending_clearing_transactions WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// --- Audit trail queries ---

pub async fn insert_transaction_event(
    executor: &mut SqlxTransaction<'_, Postgres>,
    transaction_id: Uuid,
    event_type: TransactionEventType,
    data: Value,
) -> Result<TransactionEvent> {
    sqlx::query_as::<_, TransactionEvent>(
        r#"
        INSERT INTO transaction_events (id, transaction_id, event_type, data)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(transaction_id)
    .bind(event_type)
    .bind(data)
    .fetch_one(&mut **executor)
    .await
}

pub async fn list_transaction_events(
    pool: &PgPool,
    transaction_id: Uuid,
) -> Result<Vec<TransactionEvent>> {
    sqlx::query_as::<_, TransactionEvent>(
        r#"
        SELECT * FROM transaction_events
        WHERE transaction_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await
}
