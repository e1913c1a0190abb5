use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use tracing::{error, info, warn};

use crate::db::models::Transaction;
use crate::db::queries;
use crate::domain::{
    merge_metadata, TransactionDetails, TransactionEventType, TransactionStatus, TransactionType,
};
use crate::error::AppError;
use crate::services::card_ledger::CardLedger;
use crate::services::events::{DomainEvent, EventBus};

/// Buffered clearing entries expire this long after creation.
const PENDING_CLEARING_TTL_HOURS: i64 = 24;

enum ClearingDisposition {
    Settled(Transaction),
    AlreadySettled,
    NoAuthorization,
}

/// The reconciliation engine. Merges the two independently-arriving
/// notifications of a card transaction (authorization, clearing) into one
/// ledger row, keeps the card balance projection in step, and owns the
/// out-of-order buffer for clearings that beat their authorization.
///
/// Every operation runs inside a single database transaction; the
/// transaction row, card row and audit rows commit or roll back together.
#[derive(Clone)]
pub struct ReconciliationService {
    pool: PgPool,
    ledger: CardLedger,
    events: EventBus,
}

impl ReconciliationService {
    pub fn new(pool: PgPool, ledger: CardLedger, events: EventBus) -> Self {
        Self {
            pool,
            ledger,
            events,
        }
    }

    /// Applies an authorization event. Duplicate deliveries are absorbed:
    /// the unique `(transaction_correlation_id, processor_id)` constraint
    /// makes the create atomic, and an existing row is a logged no-op.
    pub async fn process_authorization(
        &self,
        details: &TransactionDetails,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let Some(transaction) = queries::insert_transaction_if_absent(&mut tx, details).await?
        else {
            warn!(
                processor_id = %details.processor_id,
                correlation_id = %details.transaction_correlation_id,
                "authorization already processed, absorbing duplicate delivery"
            );
            tx.commit().await?;
            return Ok(());
        };

        self.ledger
            .apply_authorization(
                &mut tx,
                &transaction.card_id,
                &transaction.user_id,
                &transaction.auth_amount,
            )
            .await?;

        queries::insert_transaction_event(
            &mut tx,
            transaction.id,
            TransactionEventType::AuthorizationTransactionProcessed,
            json!({
                "status": transaction.status,
                "type": TransactionType::Authorization,
                "processor_id": details.processor_id,
                "raw_data": details.metadata,
            }),
        )
        .await?;

        tx.commit().await?;

        self.events.emit(DomainEvent::Authorized(transaction));

        // A clearing may already be sitting in the buffer for this
        // authorization. The replay is best-effort here: on failure the
        // buffered entry stays put with its retry count bumped.
        if let Err(e) = self
            .process_pending_clearing(&details.transaction_correlation_id, &details.processor_id)
            .await
        {
            error!(
                processor_id = %details.processor_id,
                correlation_id = %details.transaction_correlation_id,
                error = %e,
                "failed to replay buffered clearing transaction"
            );
        }

        Ok(())
    }

    /// Applies a clearing event. Three outcomes, none of which error to the
    /// caller: no matching authorization yet (buffer the record), already
    /// settled (absorb), or pending (merge and settle).
    pub async fn process_clearing(&self, details: &TransactionDetails) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        match self.try_settle(&mut tx, details).await? {
            ClearingDisposition::NoAuthorization => {
                warn!(
                    processor_id = %details.processor_id,
                    correlation_id = %details.transaction_correlation_id,
                    "authorization not found, buffering clearing transaction"
                );
                self.store_pending_clearing(&mut tx, details).await?;
                tx.commit().await?;
                Ok(())
            }
            ClearingDisposition::AlreadySettled => {
                warn!(
                    processor_id = %details.processor_id,
                    correlation_id = %details.transaction_correlation_id,
                    "transaction already settled, absorbing duplicate clearing"
                );
                tx.commit().await?;
                Ok(())
            }
            ClearingDisposition::Settled(transaction) => {
                tx.commit().await?;
                self.events.emit(DomainEvent::Cleared(transaction));
                Ok(())
            }
        }
    }

    /// Replays a buffered clearing once its authorization has arrived. The
    /// buffer row is locked, replayed through the clearing path and deleted
    /// in the same transaction; on failure everything rolls back except the
    /// retry bookkeeping, and the error propagates to the queue.
    pub async fn process_pending_clearing(
        &self,
        transaction_correlation_id: &str,
        processor_id: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let Some(pending) = queries::find_pending_clearing_for_update(
            &mut tx,
            transaction_correlation_id,
            processor_id,
        )
        .await?
        else {
            tx.commit().await?;
            return Ok(());
        };

        info!(
            processor_id,
            correlation_id = transaction_correlation_id,
            "replaying buffered clearing transaction"
        );

        let outcome = match serde_json::from_value::<TransactionDetails>(
            pending.transaction_data.clone(),
        ) {
            Ok(details) => self.try_settle(&mut tx, &details).await,
            Err(e) => Err(AppError::from(e)),
        };

        match outcome {
            Ok(ClearingDisposition::Settled(transaction)) => {
                queries::delete_pending_clearing(&mut tx, pending.id).await?;
                tx.commit().await?;
                info!(
                    processor_id,
                    correlation_id = transaction_correlation_id,
                    "replayed and removed buffered clearing transaction"
                );
                self.events.emit(DomainEvent::Cleared(transaction));
                Ok(())
            }
            Ok(ClearingDisposition::AlreadySettled) => {
                // A direct clearing beat the replay; the buffered copy is spent.
                warn!(
                    processor_id,
                    correlation_id = transaction_correlation_id,
                    "buffered clearing already settled, discarding buffer entry"
                );
                queries::delete_pending_clearing(&mut tx, pending.id).await?;
                tx.commit().await?;
                Ok(())
            }
            Ok(ClearingDisposition::NoAuthorization) => {
                let e = AppError::Internal(format!(
                    "authorization not found for buffered clearing {}:{}",
                    processor_id, transaction_correlation_id
                ));
                self.record_replay_failure(tx, pending.id, &e).await?;
                Err(e)
            }
            Err(e) => {
                self.record_replay_failure(tx, pending.id, &e).await?;
                Err(e)
            }
        }
    }

    /// Evicts buffered clearings whose authorization never arrived within
    /// the TTL. Idempotent; a row consumed by a concurrent replay simply no
    /// longer matches the delete predicate.
    pub async fn cleanup_expired_pending_clearing(&self) -> Result<u64, AppError> {
        let deleted = queries::delete_expired_pending_clearing(&self.pool).await?;

        if deleted > 0 {
            info!(deleted, "cleaned up expired pending clearing transactions");
        }

        Ok(deleted)
    }

    async fn try_settle(
        &self,
        tx: &mut SqlxTransaction<'_, Postgres>,
        details: &TransactionDetails,
    ) -> Result<ClearingDisposition, AppError> {
        let Some(existing) = queries::find_transaction_for_update(
            tx,
            &details.transaction_correlation_id,
            &details.processor_id,
        )
        .await?
        else {
            return Ok(ClearingDisposition::NoAuthorization);
        };

        if existing.status == TransactionStatus::Settled {
            return Ok(ClearingDisposition::AlreadySettled);
        }

        let metadata = merge_metadata(&existing.metadata, &details.metadata);

        let updated = queries::settle_transaction(
            tx,
            existing.id,
            &details.billing_amount,
            details.clearing_transaction_id.as_deref(),
            &metadata,
        )
        .await?;

        // The pending-to-settled movement uses the authorized amount; the
        // final clearing amount is recorded on the transaction row.
        self.ledger
            .apply_clearing(tx, &existing.card_id, &existing.auth_amount)
            .await?;

        queries::insert_transaction_event(
            tx,
            existing.id,
            TransactionEventType::ClearingTransactionProcessed,
            json!({
                "status": updated.status,
                "type": TransactionType::Clearing,
                "processor_id": details.processor_id,
                "raw_data": details.metadata,
            }),
        )
        .await?;

        Ok(ClearingDisposition::Settled(updated))
    }

    async fn store_pending_clearing(
        &self,
        tx: &mut SqlxTransaction<'_, Postgres>,
        details: &TransactionDetails,
    ) -> Result<(), AppError> {
        let expires_at = Utc::now() + Duration::hours(PENDING_CLEARING_TTL_HOURS);
        let transaction_data = serde_json::to_value(details)?;

        let stored =
            queries::insert_pending_clearing_if_absent(tx, details, &transaction_data, expires_at)
                .await?;

        if stored.is_some() {
            info!(
                processor_id = %details.processor_id,
                correlation_id = %details.transaction_correlation_id,
                "stored pending clearing transaction"
            );
        }

        Ok(())
    }

    /// Rolls back the failed replay transaction, then bumps the retry
    /// bookkeeping on the pool so the bump survives the rollback.
    async fn record_replay_failure(
        &self,
        tx: SqlxTransaction<'_, Postgres>,
        pending_id: uuid::Uuid,
        error: &AppError,
    ) -> Result<(), AppError> {
        error!(
            pending_id = %pending_id,
            error = %error,
            "failed to replay buffered clearing transaction"
        );
        tx.rollback().await?;
        queries::bump_pending_clearing_retry(&self.pool, pending_id).await?;
        Ok(())
    }
}
