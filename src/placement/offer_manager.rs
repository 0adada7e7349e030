//! Offer intake and expiry. The intake loop moves offers from the host
//! manager's stream into the pool; the pruner periodically evicts offers
//! past their hold time and declines them back to the offer source.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::{
    data_model::Offer,
    metrics::PlacementMetrics,
    placement::offer_pool::OfferPool,
    rpc::HostManagerClient,
};

pub struct OfferManager {
    offer_pool: Arc<OfferPool>,
    host_manager: Arc<dyn HostManagerClient>,
    pruning_period: Duration,
    metrics: Arc<PlacementMetrics>,
}

impl OfferManager {
    pub fn new(
        offer_pool: Arc<OfferPool>,
        host_manager: Arc<dyn HostManagerClient>,
        pruning_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            offer_pool,
            host_manager,
            pruning_period,
            metrics: Arc::new(PlacementMetrics::new()),
        })
    }

    /// Starts the intake and pruning loops.
    pub fn start(
        self: &Arc<Self>,
        mut offers_rx: mpsc::UnboundedReceiver<Vec<Offer>>,
        shutdown_rx: watch::Receiver<()>,
    ) {
        let manager = self.clone();
        let mut intake_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = intake_shutdown.changed() => {
                        info!("offer intake shutting down");
                        return;
                    }
                    offers = offers_rx.recv() => {
                        let Some(offers) = offers else { return };
                        debug!(count = offers.len(), "received offers");
                        manager.offer_pool.add(offers);
                    }
                }
            }
        });

        let manager = self.clone();
        let mut pruner_shutdown = shutdown_rx;
        tokio::spawn(async move {
            info!("offer pruner started");
            loop {
                tokio::select! {
                    _ = pruner_shutdown.changed() => {
                        info!("offer pruner shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(manager.pruning_period) => {
                        manager.prune(false).await;
                    }
                }
            }
        });
    }

    /// One pruning pass; `force` flushes the whole pool (leadership loss).
    pub async fn prune(&self, force: bool) {
        let expired = self.offer_pool.remove_expired(force);
        if expired.is_empty() {
            return;
        }
        self.metrics.offers_expired.add(expired.len() as u64, &[]);
        debug!(count = expired.len(), force, "declining expired offers");
        if let Err(err) = self.host_manager.decline_offers(&expired).await {
            error!(error = %err, "declining offers failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rpc::local::LocalHostManager,
        testing::test_agents,
    };

    #[tokio::test]
    async fn test_intake_fills_pool_and_declined_offers_return() {
        let host_manager = Arc::new(LocalHostManager::new(
            test_agents(2),
            Duration::from_millis(10),
        ));
        let offer_pool = Arc::new(OfferPool::new(Duration::from_secs(300)));
        let manager = OfferManager::new(
            offer_pool.clone(),
            host_manager.clone(),
            Duration::from_secs(600),
        );

        let offers_rx = host_manager.subscribe_offers();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        manager.start(offers_rx, shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(offer_pool.len(), 2, "intake moved the offers into the pool");

        // force-flush, as on leadership loss: the pool empties and the
        // declined offers go back to the offer source
        manager.prune(true).await;
        assert!(offer_pool.is_empty());

        // the loopback host manager re-offers declined hosts; intake picks
        // the fresh offers up again
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(offer_pool.len(), 2);
        let _ = shutdown_tx.send(());
    }
}
