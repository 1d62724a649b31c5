//! Listens for the domain event signalling that MISP-sourced alerts with
//! empty artifact arrays should be re-populated (spec §4.8). Modeled as
//! a channel subscription running its handler on the task runner, per
//! spec §9's translation of the original actor-based listener.

use crate::ingestion;
use crate::registry::InstanceRegistry;
use crate::store::{AlertStore, DomainEvent};
use crate::transformer;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const BACKFILL_CONCURRENCY: usize = 5;

pub struct AlertBackfillWorker {
    registry: Arc<InstanceRegistry>,
    alerts: Arc<dyn AlertStore>,
    http: reqwest::Client,
}

impl AlertBackfillWorker {
    pub fn new(registry: Arc<InstanceRegistry>, alerts: Arc<dyn AlertStore>, http: reqwest::Client) -> Self {
        Self { registry, alerts, http }
    }

    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DomainEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DomainEvent::UpdateMispAlertArtifact => self.backfill().await,
            }
        }
    }

    async fn backfill(&self) {
        let all = match self.alerts.find_all().await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "failed to enumerate alerts for backfill");
                return;
            }
        };

        let candidates: Vec<_> = all.into_iter().filter(|a| a.artifacts.is_empty()).collect();
        info!(count = candidates.len(), "backfilling empty-artifact MISP alerts");

        stream::iter(candidates)
            .map(|alert| self.backfill_one(alert))
            .buffer_unordered(BACKFILL_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;
    }

    async fn backfill_one(&self, mut alert: crate::model::Alert) {
        let instance = match self.registry.get(&alert.source) {
            Ok(instance) => instance.clone(),
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "instance lookup failed, skipping alert");
                return;
            }
        };

        let client = crate::client::MispClient::new(self.http.clone(), instance.clone());
        let response = match client.get_attributes(&alert.source_ref, None).await {
            Ok(v) => v,
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "attribute re-fetch failed during backfill");
                return;
            }
        };

        let attributes = ingestion::parse_attributes_response(&response, &alert.source_ref);
        let artifacts = attributes
            .iter()
            .filter(|a| !a.deleted)
            .flat_map(|a| transformer::transform(a, &instance, None))
            .collect();

        alert.artifacts = artifacts;
        if let Err(e) = self.alerts.update(alert.clone()).await {
            warn!(alert_id = %alert.id, error = %e, "failed to persist backfilled artifacts");
        }
    }
}
