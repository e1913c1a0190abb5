use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Transaction;
use crate::db::queries;
use crate::domain::{TransactionStatus, TransactionType};
use crate::error::AppError;

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionQuery {
    pub card_id: Option<String>,
    pub processor_id: Option<String>,
    pub status: Option<TransactionStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// A transaction as exposed to external callers, with the billing amount
/// resolved from the row's lifecycle stage.
#[derive(Debug, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub billing_amount: BigDecimal,
    pub billing_currency: String,
}

impl From<Transaction> for TransactionView {
    fn from(transaction: Transaction) -> Self {
        let billing_amount = billing_amount(&transaction);
        let billing_currency = transaction.currency.clone();
        Self {
            transaction,
            billing_amount,
            billing_currency,
        }
    }
}

/// Settled transactions bill the clearing amount, falling back to the
/// authorization amount when the processor omitted it.
fn billing_amount(transaction: &Transaction) -> BigDecimal {
    match transaction.kind {
        TransactionType::Authorization => transaction.auth_amount.clone(),
        TransactionType::Clearing => transaction
            .clearing_amount
            .clone()
            .unwrap_or_else(|| transaction.auth_amount.clone()),
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<TransactionView>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

/// Read side of the ledger: paginated listing with optional card,
/// processor and status filters.
#[derive(Clone)]
pub struct TransactionQueryService {
    pool: PgPool,
}

impl TransactionQueryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<TransactionPage, AppError> {
        let page = query.page.unwrap_or(1);
        if page < 1 {
            return Err(AppError::Validation("page must be at least 1".to_string()));
        }

        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        let offset = (page - 1) * limit;

        let transactions = queries::list_transactions(
            &self.pool,
            query.card_id.as_deref(),
            query.processor_id.as_deref(),
            query.status,
            limit,
            offset,
        )
        .await?;

        let total = queries::count_transactions(
            &self.pool,
            query.card_id.as_deref(),
            query.processor_id.as_deref(),
            query.status,
        )
        .await?;

        Ok(TransactionPage {
            transactions: transactions.into_iter().map(TransactionView::from).collect(),
            total,
            page,
            limit,
        })
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<TransactionView, AppError> {
        queries::get_transaction(&self.pool, id)
            .await?
            .map(TransactionView::from)
            .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", id)))
    }
}
