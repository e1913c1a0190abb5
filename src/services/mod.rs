pub mod card_ledger;
pub mod events;
pub mod queue;
pub mod query;
pub mod reconciliation;
pub mod scheduler;

pub use card_ledger::CardLedger;
pub use events::{DomainEvent, EventBus};
pub use queue::JobQueue;
pub use query::TransactionQueryService;
pub use reconciliation::ReconciliationService;
