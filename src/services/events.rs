use serde_json::json;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::models::Transaction;
use crate::db::queries;
use crate::domain::{TransactionEventType, TransactionType};
use crate::error::AppError;

/// Domain events carrying the post-commit transaction snapshot.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    Authorized(Transaction),
    Cleared(Transaction),
}

/// Fire-and-forget event bus. `emit` must only be called after the
/// enclosing database transaction has committed, so listeners never observe
/// rolled-back work. Listener failures never propagate back to the ledger.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            debug!("no active listeners for domain event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

/// Consumes domain events and drives the downstream side effects:
/// cardholder notification on authorization, analytics on clearing. Each
/// side effect appends its own audit row in its own transaction.
pub async fn run_listeners(pool: PgPool, mut receiver: broadcast::Receiver<DomainEvent>) {
    info!("domain event listeners started");

    loop {
        match receiver.recv().await {
            Ok(DomainEvent::Authorized(transaction)) => {
                if let Err(e) = notify_cardholder(&pool, &transaction).await {
                    error!(
                        transaction_id = %transaction.id,
                        error = %e,
                        "cardholder notification failed"
                    );
                }
            }
            Ok(DomainEvent::Cleared(transaction)) => {
                if let Err(e) = send_analytics(&pool, &transaction).await {
                    error!(
                        transaction_id = %transaction.id,
                        error = %e,
                        "analytics event failed"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event listener lagged behind, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn notify_cardholder(pool: &PgPool, transaction: &Transaction) -> Result<(), AppError> {
    info!(
        user_id = %transaction.user_id,
        card_id = %transaction.card_id,
        "notifying cardholder about authorization"
    );

    let mut tx = pool.begin().await?;
    queries::insert_transaction_event(
        &mut tx,
        transaction.id,
        TransactionEventType::CardholderNotified,
        json!({
            "user_id": transaction.user_id,
            "notification_type": TransactionType::Authorization,
            "amount": transaction.auth_amount.to_string(),
            "currency": transaction.currency,
        }),
    )
    .await?;
    tx.commit().await?;

    Ok(())
}

async fn send_analytics(pool: &PgPool, transaction: &Transaction) -> Result<(), AppError> {
    info!(
        transaction_id = %transaction.id,
        "sending analytics for cleared transaction"
    );

    let mut tx = pool.begin().await?;
    queries::insert_transaction_event(
        &mut tx,
        transaction.id,
        TransactionEventType::AnalyticsSent,
        json!({
            "transaction_type": TransactionType::Clearing,
            "amount": transaction
                .clearing_amount
                .as_ref()
                .unwrap_or(&transaction.auth_amount)
                .to_string(),
            "currency": transaction.currency,
            "card_id": transaction.card_id,
            "user_id": transaction.user_id,
            "metadata": transaction.metadata,
        }),
    )
    .await?;
    tx.commit().await?;

    Ok(())
}
