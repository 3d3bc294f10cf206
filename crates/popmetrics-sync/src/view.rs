use std::sync::Arc;

use popmetrics_storage::{AnalyticsStore, StoreError};
use tracing::{debug, info};

/// Rebuilds the per-category aggregate after a committed write.
pub struct ViewRefresher {
    store: Arc<dyn AnalyticsStore>,
    auto_provision: bool,
}

impl ViewRefresher {
    pub fn new(store: Arc<dyn AnalyticsStore>, auto_provision: bool) -> Self {
        Self {
            store,
            auto_provision,
        }
    }

    /// Refresh the view, provisioning it first when it does not exist yet and
    /// auto-provisioning is enabled.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        match self.store.refresh_aggregate_view().await {
            Ok(()) => {
                debug!("aggregate view refreshed");
                Ok(())
            }
            Err(err) if err.is_view_missing() && self.auto_provision => {
                info!("aggregate view missing, provisioning it");
                self.provision().await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn provision(&self) -> Result<(), StoreError> {
        self.store.provision_aggregate_view().await
    }
}
