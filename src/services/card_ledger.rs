use bigdecimal::BigDecimal;
use sqlx::{Postgres, Transaction as SqlxTransaction};
use tracing::{error, info, warn};

use crate::db::models::Card;
use crate::db::queries;
use crate::error::AppError;

/// Owns every write to the `cards` table. Both entry points require an open
/// database transaction and take a `FOR UPDATE` lock on the card row before
/// the read-modify-write, so concurrent reconciliations of the same card
/// serialize at the database.
#[derive(Clone)]
pub struct CardLedger {
    default_credit_limit: BigDecimal,
}

impl CardLedger {
    pub fn new(default_credit_limit: BigDecimal) -> Self {
        Self {
            default_credit_limit,
        }
    }

    /// Reserves `amount` against the card's pending balance, creating the
    /// card on first sight. The find-or-create leans on the unique
    /// constraint on `card_id`: under a race the losing insert returns
    /// nothing and falls through to the locked read.
    pub async fn apply_authorization(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        card_id: &str,
        user_id: &str,
        amount: &BigDecimal,
    ) -> Result<Card, AppError> {
        let candidate = Card::new(
            card_id.to_string(),
            user_id.to_string(),
            self.default_credit_limit.clone(),
            amount.clone(),
        );

        if let Some(card) = queries::insert_card_if_absent(executor, &candidate).await? {
            info!(
                card_id = %card.card_id,
                utilization = %card.current_utilization,
                "created card ledger entry"
            );
            self.check_credit_limit(&card);
            return Ok(card);
        }

        let mut card = queries::find_card_for_update(executor, card_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("card {} vanished during authorization", card_id))
            })?;

        card.pending_balance = &card.pending_balance + amount;
        card.recompute_derived();

        let card = queries::update_card_balances(executor, &card).await?;
        info!(
            card_id = %card.card_id,
            utilization = %card.current_utilization,
            "updated card utilization"
        );
        self.check_credit_limit(&card);

        Ok(card)
    }

    /// Moves `amount` from pending to settled. A clearing touching a card
    /// this ledger has never seen is tolerated, not fatal.
    pub async fn apply_clearing(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        card_id: &str,
        amount: &BigDecimal,
    ) -> Result<Option<Card>, AppError> {
        let Some(mut card) = queries::find_card_for_update(executor, card_id).await? else {
            warn!(card_id, "card not found for clearing, skipping balance update");
            return Ok(None);
        };

        card.settled_balance = &card.settled_balance + amount;
        card.pending_balance = &card.pending_balance - amount;
        card.recompute_derived();

        let card = queries::update_card_balances(executor, &card).await?;
        info!(
            card_id = %card.card_id,
            utilization = %card.current_utilization,
            "card utilization updated after clearing"
        );

        Ok(Some(card))
    }

    /// Overlimit state is surfaced, not prevented: the write goes through
    /// and the breach is reported for downstream action.
    fn check_credit_limit(&self, card: &Card) {
        if card.current_utilization > BigDecimal::from(100) {
            error!(
                card_id = %card.card_id,
                utilization = %card.current_utilization,
                "card has exceeded its credit limit"
            );
        }
    }
}
