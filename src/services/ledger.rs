use bigdecimal::BigDecimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};
use crate::error::PipelineError;
use crate::ports::{
    LedgerStore, Page, PageRequest, RepositoryError, RepositoryResult, TransactionFilter,
    TransactionGraph, UnitOfWork,
};
use crate::utils::cursor;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

/// Fails unless `candidate` plus every leg already recorded under `parent`
/// stays within the parent amount, whatever the leg type, so refunds share
/// the cap with split legs. A candidate that is already a child is counted
/// once, with its new amount. Failed or cancelled legs moved no money and
/// are not counted.
pub async fn check_conservation(
    unit: &mut dyn UnitOfWork,
    parent: &Transaction,
    candidate: &Transaction,
) -> Result<(), PipelineError> {
    if !candidate.transaction_type.is_derived_leg() {
        return Ok(());
    }

    let siblings = unit.children_of(parent.id).await?;
    let counted: Vec<&Transaction> = siblings
        .iter()
        .filter(|child| child.id != candidate.id)
        .filter(|child| {
            !matches!(
                child.status,
                TransactionStatus::Failed | TransactionStatus::Cancelled
            )
        })
        .collect();

    let total = counted
        .iter()
        .fold(candidate.amount.clone(), |acc, child| acc + &child.amount);
    if total > parent.amount {
        return Err(PipelineError::Invariant(format!(
            "legs of {} would total {} against a parent amount of {}",
            parent.id, total, parent.amount
        )));
    }

    Ok(())
}

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Newest first. `next_cursor` is set whenever a full page came back.
    pub async fn list(
        &self,
        filter: &TransactionFilter,
        limit: Option<i64>,
        after: Option<&str>,
    ) -> Result<Page<Transaction>, PipelineError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let after = after
            .map(cursor::decode)
            .transpose()
            .map_err(PipelineError::InvalidCursor)?;

        let items = self
            .store
            .list_transactions(filter, &PageRequest { limit, after })
            .await?;

        let next_cursor = if items.len() as i64 == limit {
            items.last().map(|tx| cursor::encode(tx.created_at, tx.id))
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    pub async fn graph(&self, id: Uuid) -> RepositoryResult<TransactionGraph> {
        self.store
            .transaction_graph(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))
    }
}
