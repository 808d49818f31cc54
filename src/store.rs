//! Store lookup interface and the in-memory store seeded from configuration
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{Consumer, Deployment, PricingPlan};

/// Source of truth for deployments, consumers and plans.
///
/// `Ok(None)` means the record does not exist. Errors are faults of the
/// store itself; [`StoreError::Transient`] faults are retried once by the cache.
#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError>;

    async fn fetch_consumer(&self, id: &str) -> Result<Option<Consumer>, StoreError>;

    async fn fetch_plan(&self, slug: &str) -> Result<Option<PricingPlan>, StoreError>;
}

/// Store backed by concurrent maps
#[derive(Default)]
pub struct InMemoryStore {
    deployments: DashMap<String, Deployment>,
    consumers: DashMap<String, Consumer>,
    plans: DashMap<String, PricingPlan>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding every record of the `store` config section
    pub fn from_config(config: &StoreConfig) -> Self {
        let store = Self::new();
        for deployment in &config.deployments {
            store.put_deployment(deployment.clone());
        }
        for consumer in &config.consumers {
            store.put_consumer(consumer.clone());
        }
        for plan in &config.plans {
            store.put_plan(plan.clone());
        }
        debug!(
            "Seeded store with {} deployments, {} consumers, {} plans",
            store.deployments.len(),
            store.consumers.len(),
            store.plans.len()
        );
        store
    }

    pub fn put_deployment(&self, deployment: Deployment) {
        self.deployments.insert(deployment.id.clone(), deployment);
    }

    pub fn put_consumer(&self, consumer: Consumer) {
        self.consumers.insert(consumer.id.clone(), consumer);
    }

    pub fn put_plan(&self, plan: PricingPlan) {
        self.plans.insert(plan.slug.clone(), plan);
    }

    pub fn remove_deployment(&self, id: &str) -> Option<Deployment> {
        self.deployments.remove(id).map(|(_, d)| d)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn fetch_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.deployments.get(id).map(|d| d.value().clone()))
    }

    async fn fetch_consumer(&self, id: &str) -> Result<Option<Consumer>, StoreError> {
        Ok(self.consumers.get(id).map(|c| c.value().clone()))
    }

    async fn fetch_plan(&self, slug: &str) -> Result<Option<PricingPlan>, StoreError> {
        Ok(self.plans.get(slug).map(|p| p.value().clone()))
    }
}
