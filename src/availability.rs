//! Availability questions answered on top of an [`IntervalStore`].
//!
//! Date ranges are closed: a restriction ending on the day a request starts
//! still makes the item unavailable.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::model::*;
use crate::observability::AVAILABILITY_CHECKS_TOTAL;
use crate::store::IntervalStore;

#[derive(Clone)]
pub struct AvailabilityEngine {
    store: Arc<dyn IntervalStore>,
}

impl AvailabilityEngine {
    pub fn new(store: Arc<dyn IntervalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn IntervalStore> {
        &self.store
    }

    pub async fn is_item_available(
        &self,
        item_id: ItemId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool> {
        let span = DateSpan::new(start, end)?;
        self.check(item_id, span).await.map(|blocking| blocking.is_empty())
    }

    /// Empty is a normal answer, not an error.
    pub async fn available_items(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Item>> {
        let span = DateSpan::new(start, end)?;
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "scope" => "all").increment(1);
        self.store.items_free_in_range(span).await
    }

    /// Restrictions standing in the way of booking `item_id` for `span`.
    pub async fn check(&self, item_id: ItemId, span: DateSpan) -> Result<Vec<Restriction>> {
        if item_id <= 0 {
            return Err(Error::validation(format!("item id must be positive, got {item_id}")));
        }
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "scope" => "item").increment(1);
        let blocking = self.store.restrictions_for_item_in_range(item_id, span).await?;
        tracing::debug!(item_id, %span, blocking = blocking.len(), "availability checked");
        Ok(blocking)
    }
}
