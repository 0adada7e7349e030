//! Pool of live host offers. Offers sit in the pool from receipt until they
//! are acquired for placement, declined after expiry, or force-flushed on
//! leadership loss. The pool is the single writer for offer lifetime.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    data_model::{Offer, OfferId},
    rpc::HostFilter,
};

struct TimedOffer {
    offer: Offer,
    received_at: Instant,
}

pub struct OfferPool {
    offers: RwLock<HashMap<OfferId, TimedOffer>>,
    hold_time: Duration,
}

impl OfferPool {
    pub fn new(hold_time: Duration) -> Self {
        Self {
            offers: RwLock::new(HashMap::new()),
            hold_time,
        }
    }

    /// Inserts offers, deduplicating by id. A re-sent id keeps the original
    /// arrival time.
    pub fn add(&self, offers: Vec<Offer>) {
        let mut pool = self.offers.write().unwrap();
        for offer in offers {
            pool.entry(offer.id.clone()).or_insert_with(|| TimedOffer {
                offer,
                received_at: Instant::now(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.offers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns offers past their hold time, or every offer when
    /// `force` is set. The caller declines them to the offer source.
    pub fn remove_expired(&self, force: bool) -> Vec<OfferId> {
        let mut pool = self.offers.write().unwrap();
        let expired: Vec<OfferId> = pool
            .iter()
            .filter(|(_, timed)| force || timed.received_at.elapsed() > self.hold_time)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            pool.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), force, "removed expired offers");
        }
        expired
    }

    /// Takes up to `limit` offers able to satisfy the filter's minimum
    /// demand. Ownership transfers to the caller until released.
    pub fn acquire(&self, filter: &HostFilter, limit: usize) -> Vec<Offer> {
        let mut pool = self.offers.write().unwrap();
        let matching: Vec<OfferId> = pool
            .iter()
            .filter(|(_, timed)| Self::matches(&timed.offer, filter))
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();
        matching
            .into_iter()
            .filter_map(|id| pool.remove(&id))
            .map(|timed| timed.offer)
            .collect()
    }

    /// Puts offers back, keeping their age fresh (a launch failure should
    /// not eat into the hold time twice).
    pub fn release(&self, offers: Vec<Offer>) {
        let mut pool = self.offers.write().unwrap();
        for offer in offers {
            pool.insert(
                offer.id.clone(),
                TimedOffer {
                    offer,
                    received_at: Instant::now(),
                },
            );
        }
    }

    fn matches(offer: &Offer, filter: &HostFilter) -> bool {
        if offer.resources.can_handle(&filter.minimum).is_err() {
            return false;
        }
        if u64::from(filter.num_ports) > offer.resources.available_ports() {
            return false;
        }
        if let Some(constraint) = &filter.constraint {
            let satisfied = offer
                .attributes
                .iter()
                .any(|label| label.key == constraint.attribute && label.value == constraint.value);
            if !satisfied {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{test_objects::tests::*, Label};

    fn pool_with(offers: Vec<(Offer, Duration)>, hold: Duration) -> OfferPool {
        let pool = OfferPool::new(hold);
        {
            let mut map = pool.offers.write().unwrap();
            for (offer, age) in offers {
                map.insert(
                    offer.id.clone(),
                    TimedOffer {
                        offer,
                        received_at: Instant::now() - age,
                    },
                );
            }
        }
        pool
    }

    #[test]
    fn test_remove_expired() {
        // empty pool
        let pool = OfferPool::new(Duration::from_secs(60));
        assert!(pool.remove_expired(false).is_empty());

        // all offers within the hold time
        let pool = pool_with(
            vec![
                (mock_offer("offer1", "host1", 4.0, 4096.0, &[]), Duration::ZERO),
                (mock_offer("offer2", "host2", 4.0, 4096.0, &[]), Duration::ZERO),
            ],
            Duration::from_secs(60),
        );
        assert!(pool.remove_expired(false).is_empty());
        assert_eq!(pool.len(), 2);

        // one offer two minutes old with a one minute hold
        let pool = pool_with(
            vec![
                (mock_offer("offer1", "host1", 4.0, 4096.0, &[]), Duration::ZERO),
                (
                    mock_offer("offer2", "host2", 4.0, 4096.0, &[]),
                    Duration::from_secs(120),
                ),
                (mock_offer("offer3", "host3", 4.0, 4096.0, &[]), Duration::ZERO),
            ],
            Duration::from_secs(60),
        );
        let expired = pool.remove_expired(false);
        assert_eq!(expired, vec![OfferId::from("offer2")]);
        assert_eq!(pool.len(), 2);

        // force removes everything regardless of age
        let pool = pool_with(
            vec![
                (mock_offer("offer1", "host1", 4.0, 4096.0, &[]), Duration::ZERO),
                (mock_offer("offer2", "host2", 4.0, 4096.0, &[]), Duration::ZERO),
            ],
            Duration::from_secs(300),
        );
        let mut expired = pool.remove_expired(true);
        expired.sort_by(|a, b| a.get().cmp(b.get()));
        assert_eq!(
            expired,
            vec![OfferId::from("offer1"), OfferId::from("offer2")]
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn test_add_dedupes_by_id() {
        let pool = OfferPool::new(Duration::from_secs(60));
        let offer = mock_offer("offer1", "host1", 4.0, 4096.0, &[]);
        pool.add(vec![offer.clone(), offer.clone()]);
        pool.add(vec![offer]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_acquire_respects_filter_and_limit() {
        let pool = OfferPool::new(Duration::from_secs(60));
        pool.add(vec![
            mock_offer("small", "host1", 1.0, 512.0, &[]),
            mock_offer("big1", "host2", 8.0, 8192.0, &[(31000, 32000)]),
            mock_offer("big2", "host3", 8.0, 8192.0, &[(31000, 32000)]),
        ]);

        let filter = HostFilter {
            minimum: crate::data_model::resources::ResourceSpec {
                cpu_limit: 4.0,
                mem_limit_mb: 1024.0,
                ..Default::default()
            },
            num_ports: 1,
            constraint: None,
        };
        let acquired = pool.acquire(&filter, 10);
        assert_eq!(acquired.len(), 2);
        assert_eq!(pool.len(), 1, "acquired offers leave the pool");

        // released offers are acquirable again
        pool.release(acquired);
        assert_eq!(pool.acquire(&filter, 1).len(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_acquire_honors_scheduling_constraint() {
        let pool = OfferPool::new(Duration::from_secs(60));
        let mut offer = mock_offer("offer1", "host1", 8.0, 8192.0, &[]);
        offer.attributes.push(Label {
            key: "zone".to_string(),
            value: "dc1".to_string(),
        });
        pool.add(vec![offer]);

        let mut filter = HostFilter {
            minimum: Default::default(),
            num_ports: 0,
            constraint: Some(crate::data_model::SchedulingConstraint {
                attribute: "zone".to_string(),
                value: "dc2".to_string(),
            }),
        };
        assert!(pool.acquire(&filter, 1).is_empty());

        filter.constraint = Some(crate::data_model::SchedulingConstraint {
            attribute: "zone".to_string(),
            value: "dc1".to_string(),
        });
        assert_eq!(pool.acquire(&filter, 1).len(), 1);
    }
}
