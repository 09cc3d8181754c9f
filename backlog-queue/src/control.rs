//! Operator actions on deferred lists.

use crate::error::QueueResult;
use crate::store::ItemListStore;
use backlog_log::{debug, info};
use serde::Serialize;

/// Outcome of an operator action on one item type's deferred ring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeferralReport {
    /// Deferred lists remaining after the action
    pub deferred_count: usize,
    /// Lists handed back to the workers
    pub restarted_count: usize,
    /// Lists thrown away with their payloads
    pub discarded_count: usize,
}

/// Inspect and act on deferred lists.
///
/// ```
/// use backlog_queue::{DeferralControl, Environment, ItemListStore, ListKey, StoreConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> backlog_queue::QueueResult<()> {
/// let store = ItemListStore::in_memory(StoreConfig::new(Environment::Dev))?;
/// store.add_deferred(&ListKey::new("webhook")?).await?;
///
/// let control = DeferralControl::new(store.clone());
/// let report = control.resubmit_all("webhook").await?;
///
/// assert_eq!(report.restarted_count, 1);
/// assert_eq!(report.deferred_count, 0);
/// assert_eq!(store.pending_count("webhook").await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeferralControl {
    store: ItemListStore,
}

impl DeferralControl {
    /// Create a control over `store`.
    pub fn new(store: ItemListStore) -> Self {
        Self { store }
    }

    /// Number of deferred lists.
    pub async fn deferred_count(&self, item_type: &str) -> QueueResult<DeferralReport> {
        Ok(DeferralReport {
            deferred_count: self.store.get_deferred_count(item_type).await?,
            ..Default::default()
        })
    }

    /// Hand every deferred list back to the workers as new work.
    ///
    /// Each list is registered in the index before it leaves the ring.
    pub async fn resubmit_all(&self, item_type: &str) -> QueueResult<DeferralReport> {
        let mut restarted = 0;

        while let Some(key) = self.store.select_for_undeferral(item_type).await? {
            self.store.add_new(&key).await?;
            self.store.remove_deferred(&key).await?;
            debug!("Resubmitted deferred list '{}'", key);
            restarted += 1;
        }

        let report = DeferralReport {
            deferred_count: self.store.get_deferred_count(item_type).await?,
            restarted_count: restarted,
            discarded_count: 0,
        };
        info!(
            "Resubmitted {} deferred list(s) of '{}'",
            restarted, item_type
        );
        Ok(report)
    }

    /// Throw away every deferred list together with its payloads.
    pub async fn discard_all(&self, item_type: &str) -> QueueResult<DeferralReport> {
        let mut discarded = 0;

        while let Some(key) = self.store.select_for_undeferral(item_type).await? {
            self.store.remove_deferred(&key).await?;
            self.store.delete_items(&key).await?;
            debug!("Discarded deferred list '{}'", key);
            discarded += 1;
        }

        let report = DeferralReport {
            deferred_count: self.store.get_deferred_count(item_type).await?,
            restarted_count: 0,
            discarded_count: discarded,
        };
        info!("Discarded {} deferred list(s) of '{}'", discarded, item_type);
        Ok(report)
    }
}
