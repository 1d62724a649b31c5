//! The ingestion core (spec §4.5): per-instance scan for events published
//! after the instance's watermark, resolution to existing alerts,
//! attribute fetch, create-or-update decision, and per-event outcome
//! reporting. Instances run unordered and in parallel; within one
//! instance, events are processed sequentially to avoid last-write-wins
//! races on the same alert (spec §5).

use crate::client::MispClient;
use crate::error::SyncError;
use crate::model::{Alert, AlertStatus, Artifact, ArtifactValue, InstanceConfig, MispAttribute, MispEventSummary};
use crate::registry::InstanceRegistry;
use crate::store::{AlertStore, ArtifactStore, CaseStore};
use crate::transformer;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-instance event-processing concurrency never parallelizes within a
/// single instance; this bounds how many *instances* run concurrently.
const INSTANCE_CONCURRENCY: usize = 8;

#[derive(Debug)]
pub enum EventOutcome {
    Success(Alert),
    Failure(SyncError),
}

pub struct IngestionPipeline {
    registry: Arc<InstanceRegistry>,
    alerts: Arc<dyn AlertStore>,
    cases: Arc<dyn CaseStore>,
    case_artifacts: Arc<dyn ArtifactStore>,
    http: reqwest::Client,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        alerts: Arc<dyn AlertStore>,
        cases: Arc<dyn CaseStore>,
        case_artifacts: Arc<dyn ArtifactStore>,
        http: reqwest::Client,
    ) -> Self {
        Self { registry, alerts, cases, case_artifacts, http }
    }

    pub async fn synchronize(&self) -> Vec<(String, Vec<EventOutcome>)> {
        self.run(false).await
    }

    /// Forces the watermark to absent, disabling delta filtering and
    /// rewriting alert status more aggressively.
    pub async fn full_synchronize(&self) -> Vec<(String, Vec<EventOutcome>)> {
        self.run(true).await
    }

    async fn run(&self, full: bool) -> Vec<(String, Vec<EventOutcome>)> {
        let instances: Vec<InstanceConfig> = self.registry.all().cloned().collect();
        stream::iter(instances)
            .map(|instance| {
                let alerts = Arc::clone(&self.alerts);
                let cases = Arc::clone(&self.cases);
                let case_artifacts = Arc::clone(&self.case_artifacts);
                let http = self.http.clone();
                async move {
                    let name = instance.name.clone();
                    let client = MispClient::new(http, instance);
                    let outcomes =
                        sync_one_instance(&client, alerts.as_ref(), cases.as_ref(), case_artifacts.as_ref(), full)
                            .await;
                    (name, outcomes)
                }
            })
            .buffer_unordered(INSTANCE_CONCURRENCY)
            .collect()
            .await
    }
}

async fn watermark(alerts: &dyn AlertStore, instance: &str, full: bool) -> Option<i64> {
    if full {
        return None;
    }
    match alerts.find_by_source(instance).await {
        Ok(existing) if !existing.is_empty() => {
            existing.iter().map(|a| a.last_sync_date).max()
        }
        Ok(_) => Some(0),
        Err(e) => {
            warn!(instance, error = %e, "failed to compute watermark, defaulting to epoch");
            Some(0)
        }
    }
}

async fn sync_one_instance(
    client: &MispClient,
    alerts: &dyn AlertStore,
    cases: &dyn CaseStore,
    case_artifacts: &dyn ArtifactStore,
    full: bool,
) -> Vec<EventOutcome> {
    let instance = client.instance();
    let wm = watermark(alerts, &instance.name, full).await;

    let index_response = match client.get_index_since(wm.unwrap_or(0)).await {
        Ok(v) => v,
        Err(e) => {
            warn!(instance = %instance.name, error = %e, "index fetch failed, instance batch dropped this tick");
            return vec![EventOutcome::Failure(e)];
        }
    };

    let summaries = parse_index_response(&index_response, &instance.name);
    info!(instance = %instance.name, events = summaries.len(), "fetched event index");

    let mut outcomes = Vec::with_capacity(summaries.len());
    for summary in summaries {
        outcomes.push(process_event(client, alerts, cases, case_artifacts, &summary, wm, full).await);
    }
    outcomes
}

async fn process_event(
    client: &MispClient,
    alerts: &dyn AlertStore,
    cases: &dyn CaseStore,
    case_artifacts: &dyn ArtifactStore,
    summary: &MispEventSummary,
    watermark: Option<i64>,
    full: bool,
) -> EventOutcome {
    let instance = client.instance();
    let existing = match alerts.get(&instance.name, &summary.source_ref).await {
        Ok(a) => a,
        Err(e) => return EventOutcome::Failure(e),
    };

    let since = match (&existing, watermark) {
        (Some(alert), Some(_)) => Some(alert.last_sync_date),
        _ => None,
    };

    if let Some(alert) = &existing {
        if !alert.follow && !full {
            return EventOutcome::Success(alert.clone());
        }
    }

    let attributes_response = match client.get_attributes(&summary.source_ref, since).await {
        Ok(v) => v,
        Err(e) => return EventOutcome::Failure(e),
    };
    let raw_attributes = find_attributes(&attributes_response);
    let parsed = parse_attributes(&raw_attributes, &summary.source_ref);

    let mut artifacts = Vec::new();
    let mut max_date = since.unwrap_or(0);
    for attr in &parsed {
        if attr.deleted {
            continue;
        }
        max_date = max_date.max(attr.date);
        artifacts.extend(transformer::transform(attr, instance, since));
    }

    match existing {
        None => {
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                source: instance.name.clone(),
                source_ref: summary.source_ref.clone(),
                last_sync_date: max_date,
                status: AlertStatus::New,
                follow: true,
                artifacts,
                case_template: instance.case_template.clone(),
                case_id: None,
            };
            match alerts.create(alert).await {
                Ok(a) => EventOutcome::Success(a),
                Err(e) => EventOutcome::Failure(e),
            }
        }
        Some(mut alert) => {
            let new_artifacts = artifacts;
            let previous_artifacts = std::mem::take(&mut alert.artifacts);
            alert.artifacts = merge_artifacts(previous_artifacts, new_artifacts.clone());
            alert.last_sync_date = alert.last_sync_date.max(max_date);
            if !full && alert.status != AlertStatus::New {
                alert.status = AlertStatus::Updated;
            }

            if let Some(case_id) = alert.case_id.clone() {
                merge_into_case(cases, case_artifacts, &case_id, alert.status, full, new_artifacts).await;
            }

            match alerts.update(alert).await {
                Ok(a) => EventOutcome::Success(a),
                Err(e) => EventOutcome::Failure(e),
            }
        }
    }
}

/// Identity used to avoid re-appending the same artifact across syncs
/// (most importantly full syncs, which re-derive artifacts from every
/// attribute on the event rather than only the ones newer than a
/// watermark).
fn artifact_key(artifact: &Artifact) -> String {
    let discriminant = match &artifact.value {
        ArtifactValue::Data(v) => format!("data:{v}"),
        ArtifactValue::Attachment(file) => format!("attachment:{}", file.name),
        ArtifactValue::RemoteAttachment { reference, .. } => format!("remote:{reference}"),
    };
    format!("{}:{}", artifact.data_type, discriminant)
}

/// Appends `incoming` artifacts onto `existing`, skipping any whose key
/// (per `artifact_key`) is already present — this is the merge spec §4.5
/// step 4 requires in place of an outright overwrite, so a delta sync
/// accumulates artifacts instead of discarding everything ingested on
/// prior cycles.
fn merge_artifacts(existing: Vec<Artifact>, incoming: Vec<Artifact>) -> Vec<Artifact> {
    let mut seen: HashSet<String> = existing.iter().map(artifact_key).collect();
    let mut merged = existing;
    for artifact in incoming {
        if seen.insert(artifact_key(&artifact)) {
            merged.push(artifact);
        }
    }
    merged
}

fn alert_status_label(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::New => "new",
        AlertStatus::Updated => "updated",
        AlertStatus::Imported => "imported",
        AlertStatus::Ignored => "ignored",
    }
}

/// Spec §4.5 step 4: "if a case has been created from the alert, merge
/// alert fields into the case (on full-sync, do not overwrite case
/// status), then append the new artifacts to the case." The only
/// alert field with a case-shaped analog is status, so that is what
/// gets merged; the case's own artifact list only ever grows by the
/// artifacts freshly derived this cycle, not the alert's full merged set.
async fn merge_into_case(
    cases: &dyn CaseStore,
    case_artifacts: &dyn ArtifactStore,
    case_id: &str,
    alert_status: AlertStatus,
    full: bool,
    new_artifacts: Vec<Artifact>,
) {
    match cases.get(case_id).await {
        Ok(Some(mut case)) => {
            if !full {
                case.status = alert_status_label(alert_status).to_string();
            }
            if let Err(e) = cases.update(case).await {
                warn!(case_id, error = %e, "failed to merge alert fields into case");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(case_id, error = %e, "failed to load case for alert merge"),
    }

    if !new_artifacts.is_empty() {
        if let Err(e) = case_artifacts.append(case_id, new_artifacts).await {
            warn!(case_id, error = %e, "failed to append new artifacts to case");
        }
    }
}

/// MISP's `events/index` response: tolerates either a bare array or a
/// `{"response": [...]}` envelope. Summaries that fail to parse are
/// logged and skipped; a raw/parsed count mismatch is a warning only.
fn parse_index_response(response: &Value, instance: &str) -> Vec<MispEventSummary> {
    let raw = response
        .as_array()
        .cloned()
        .or_else(|| response.get("response").and_then(Value::as_array).cloned())
        .unwrap_or_default();

    let mut summaries = Vec::with_capacity(raw.len());
    for item in &raw {
        match parse_one_summary(item, instance) {
            Ok(summary) => summaries.push(summary),
            Err(e) => warn!(instance, error = %e, "skipping unparsable event summary"),
        }
    }

    if summaries.len() != raw.len() {
        warn!(
            instance,
            parsed = summaries.len(),
            raw = raw.len(),
            "parsed fewer event summaries than raw entries"
        );
    }
    summaries
}

fn as_id_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value.as_i64().map(|n| n.to_string()))
}

fn parse_one_summary(item: &Value, instance: &str) -> Result<MispEventSummary, SyncError> {
    let err = |msg: &str| SyncError::Parse {
        what: "event summary".to_string(),
        message: msg.to_string(),
    };

    let source_ref = item
        .get("id")
        .and_then(as_id_string)
        .ok_or_else(|| err("missing id"))?;
    let info = item.get("info").and_then(Value::as_str).unwrap_or_default().to_string();
    let publish_timestamp = item
        .get("publish_timestamp")
        .and_then(as_id_string)
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let threat_level = item
        .get("threat_level_id")
        .and_then(as_id_string)
        .and_then(|s| s.parse::<i64>().ok());
    let date = item.get("date").and_then(Value::as_str).map(str::to_string);
    let tags = item
        .get("Tag")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(MispEventSummary {
        source: instance.to_string(),
        source_ref,
        publish_timestamp,
        info,
        threat_level,
        date,
        tags,
    })
}

/// Finds the `response.Attribute[*]` array regardless of how deeply MISP
/// nests it for a given endpoint version.
pub(crate) fn find_attributes(value: &Value) -> Vec<Value> {
    if let Some(arr) = value.get("Attribute").and_then(Value::as_array) {
        return arr.clone();
    }
    match value {
        Value::Object(map) => {
            for v in map.values() {
                let found = find_attributes(v);
                if !found.is_empty() {
                    return found;
                }
            }
            Vec::new()
        }
        Value::Array(arr) => {
            for v in arr {
                let found = find_attributes(v);
                if !found.is_empty() {
                    return found;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

pub(crate) fn parse_attributes_response(response: &Value, event_id: &str) -> Vec<MispAttribute> {
    parse_attributes(&find_attributes(response), event_id)
}

fn parse_attributes(raw: &[Value], event_id: &str) -> Vec<MispAttribute> {
    raw.iter()
        .filter_map(|item| match parse_one_attribute(item) {
            Ok(attr) => Some(attr),
            Err(e) => {
                warn!(event_id, error = %e, "skipping unparsable attribute");
                None
            }
        })
        .collect()
}

fn parse_one_attribute(item: &Value) -> Result<MispAttribute, SyncError> {
    let err = |msg: &str| SyncError::Parse {
        what: "attribute".to_string(),
        message: msg.to_string(),
    };

    let id = item.get("id").and_then(as_id_string).ok_or_else(|| err("missing id"))?;
    let attr_type = item
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| err("missing type"))?
        .to_string();
    let category = item.get("category").and_then(Value::as_str).unwrap_or("").to_string();
    let value = item.get("value").and_then(Value::as_str).ok_or_else(|| err("missing value"))?.to_string();
    let comment = item.get("comment").and_then(Value::as_str).unwrap_or("").to_string();
    let date = item
        .get("timestamp")
        .and_then(as_id_string)
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);
    let deleted = item.get("deleted").and_then(Value::as_bool).unwrap_or(false);
    let tags = item
        .get("Tag")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(MispAttribute {
        id,
        attr_type,
        category,
        value,
        comment,
        date,
        tags,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Case;
    use crate::store::{CaseStore, InMemoryArtifactStore, InMemoryAlertStore, InMemoryCaseStore};
    use serde_json::json;

    fn data_artifact(data_type: &str, value: &str) -> Artifact {
        Artifact {
            data_type: data_type.to_string(),
            value: ArtifactValue::Data(value.to_string()),
            tags: vec![],
            tlp: 2,
            message: None,
            start_date: None,
        }
    }

    #[test]
    fn find_attributes_locates_nested_array() {
        let response = json!({
            "response": { "Attribute": [ { "id": "1" }, { "id": "2" } ] }
        });
        assert_eq!(find_attributes(&response).len(), 2);
    }

    #[test]
    fn find_attributes_returns_empty_when_absent() {
        let response = json!({ "response": {} });
        assert!(find_attributes(&response).is_empty());
    }

    #[test]
    fn parse_index_response_skips_unparsable_entries_and_warns_on_mismatch() {
        let response = json!([
            { "id": "42", "info": "phish", "publish_timestamp": "1704067200" },
            { "info": "missing id" },
        ]);
        let summaries = parse_index_response(&response, "demo");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].source_ref, "42");
    }

    #[tokio::test]
    async fn watermark_is_epoch_for_instance_with_no_alerts() {
        let store = InMemoryAlertStore::new();
        let wm = watermark(&store, "demo", false).await;
        assert_eq!(wm, Some(0));
    }

    #[tokio::test]
    async fn watermark_tracks_max_last_sync_date() {
        let store = InMemoryAlertStore::new();
        store
            .create(Alert {
                id: "a1".to_string(),
                source: "demo".to_string(),
                source_ref: "1".to_string(),
                last_sync_date: 100,
                status: AlertStatus::New,
                follow: true,
                artifacts: vec![],
                case_template: None,
                case_id: None,
            })
            .await
            .unwrap();
        store
            .create(Alert {
                id: "a2".to_string(),
                source: "demo".to_string(),
                source_ref: "2".to_string(),
                last_sync_date: 300,
                status: AlertStatus::New,
                follow: true,
                artifacts: vec![],
                case_template: None,
                case_id: None,
            })
            .await
            .unwrap();

        assert_eq!(watermark(&store, "demo", false).await, Some(300));
        assert_eq!(watermark(&store, "demo", true).await, None);
    }

    /// S2: a delta update carrying only the newly-seen attribute must
    /// accumulate onto the alert's existing artifacts, not replace them.
    #[test]
    fn delta_update_merges_new_artifacts_onto_existing_ones() {
        let existing = vec![data_artifact("ip", "1.2.3.4")];
        let incoming = vec![data_artifact("hash", "d41d8cd98f00b204e9800998ecf8427e")];
        let merged = merge_artifacts(existing, incoming);
        assert_eq!(merged.len(), 2);
    }

    /// A full sync re-derives artifacts from every attribute on the event,
    /// including ones already ingested; merging must not duplicate them.
    #[test]
    fn merge_is_idempotent_for_already_seen_artifacts() {
        let existing = vec![data_artifact("ip", "1.2.3.4")];
        let incoming = vec![data_artifact("ip", "1.2.3.4"), data_artifact("hash", "abc")];
        let merged = merge_artifacts(existing, incoming);
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn merge_into_case_updates_status_and_appends_artifacts() {
        let case_store = InMemoryCaseStore::new();
        case_store
            .seed(Case {
                id: "c1".to_string(),
                title: "C1".to_string(),
                severity: 2,
                start_date: chrono::Utc::now(),
                status: "open".to_string(),
                artifacts: vec![],
            })
            .await;
        let artifact_store = InMemoryArtifactStore::new(case_store.shared());

        merge_into_case(
            &case_store,
            &artifact_store,
            "c1",
            AlertStatus::Updated,
            false,
            vec![data_artifact("hash", "abc")],
        )
        .await;

        let case = case_store.get("c1").await.unwrap().unwrap();
        assert_eq!(case.status, "updated");
        assert_eq!(case.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn merge_into_case_preserves_status_on_full_sync() {
        let case_store = InMemoryCaseStore::new();
        case_store
            .seed(Case {
                id: "c1".to_string(),
                title: "C1".to_string(),
                severity: 2,
                start_date: chrono::Utc::now(),
                status: "closed".to_string(),
                artifacts: vec![],
            })
            .await;
        let artifact_store = InMemoryArtifactStore::new(case_store.shared());

        merge_into_case(&case_store, &artifact_store, "c1", AlertStatus::New, true, vec![]).await;

        let case = case_store.get("c1").await.unwrap().unwrap();
        assert_eq!(case.status, "closed");
        assert!(case.artifacts.is_empty());
    }
}
