//! Case -> event export (spec §4.6): deduplicate artifacts, create or
//! reuse a remote event, submit only attributes not already present,
//! and emit/update the local reconciliation alert.

use crate::client::MispClient;
use crate::error::{SyncError, SyncResult};
use crate::model::{Alert, AlertStatus, Artifact, ArtifactValue, Case, ExportValue, ExportedAttribute, InstanceConfig};
use crate::store::AlertStore;
use crate::taxonomy::data_type_to_misp;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct ExportPipeline {
    alerts: Arc<dyn AlertStore>,
}

impl ExportPipeline {
    pub fn new(alerts: Arc<dyn AlertStore>) -> Self {
        Self { alerts }
    }

    pub async fn export(&self, client: &MispClient, case: &Case) -> SyncResult<Alert> {
        let instance = client.instance();

        let existing_alert = self.find_existing(instance, &case.id).await?;
        let pre_existing_event_id = existing_alert.as_ref().map(|a| a.source_ref.clone());

        let candidates = build_exported_attributes(&case.artifacts)?;
        let deduplicated = deduplicate(candidates);

        let (event_id, already_exported) = match pre_existing_event_id {
            None => self.create_event(client, case, &deduplicated).await?,
            Some(event_id) => {
                let exported = self.fetch_exported_values(client, &event_id).await?;
                (event_id, exported)
            }
        };

        for attribute in &deduplicated {
            let value_key = export_value_key(&attribute.value);
            if already_exported.contains(&value_key) {
                continue;
            }
            self.upload_attribute(client, &event_id, attribute).await?;
        }

        let reconciliation_artifacts: Vec<Artifact> = deduplicated.iter().map(to_artifact).collect();
        let alert = Alert {
            id: existing_alert.map(|a| a.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source: instance.name.clone(),
            source_ref: event_id.clone(),
            last_sync_date: 0,
            status: AlertStatus::Imported,
            follow: false,
            artifacts: reconciliation_artifacts,
            case_template: instance.case_template.clone(),
            case_id: Some(case.id.clone()),
        };

        info!(instance = %instance.name, event_id, case = %case.id, "exported case to MISP");
        self.alerts.update(alert).await
    }

    async fn find_existing(&self, instance: &InstanceConfig, case_id: &str) -> SyncResult<Option<Alert>> {
        let alerts = self.alerts.find_by_source(&instance.name).await?;
        Ok(alerts.into_iter().find(|a| a.case_id.as_deref() == Some(case_id)))
    }

    async fn create_event(
        &self,
        client: &MispClient,
        case: &Case,
        attributes: &[ExportedAttribute],
    ) -> SyncResult<(String, HashSet<String>)> {
        let inline: Vec<&ExportedAttribute> = attributes
            .iter()
            .filter(|a| matches!(a.value, ExportValue::Data(_)))
            .collect();

        let payload = json!({
            "Event": {
                "distribution": 0,
                "threat_level_id": case.severity,
                "analysis": 0,
                "info": case.title,
                "date": case.start_date.format("%y-%m-%d").to_string(),
                "published": false,
                "Attribute": inline.iter().map(|a| attribute_payload(a)).collect::<Vec<_>>(),
            }
        });

        let response = client.create_event(payload).await?;
        let event_id = response
            .get("Event")
            .and_then(|e| e.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Export {
                artifact: "event".to_string(),
                message: "event creation response missing id".to_string(),
            })?;

        let error_indices = parse_attribute_error_indices(&response);
        let already_exported: HashSet<String> = inline
            .iter()
            .enumerate()
            .filter(|(i, _)| !error_indices.contains(i))
            .map(|(_, a)| export_value_key(&a.value))
            .collect();

        Ok((event_id, already_exported))
    }

    async fn fetch_exported_values(&self, client: &MispClient, event_id: &str) -> SyncResult<HashSet<String>> {
        let response = client.get_attributes(event_id, None).await?;
        let attributes = crate::ingestion::find_attributes(&response);
        Ok(attributes
            .iter()
            .filter_map(|a| a.get("value").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn upload_attribute(&self, client: &MispClient, event_id: &str, attribute: &ExportedAttribute) -> SyncResult<()> {
        match &attribute.value {
            ExportValue::Data(_) => {
                let payload = attribute_payload(attribute);
                client.add_attribute(event_id, payload).await.map_err(|e| SyncError::Export {
                    artifact: exported_attribute_label(attribute),
                    message: export_error_message(&e),
                })?;
            }
            ExportValue::Attachment(file) => {
                let bytes = std::fs::read(&file.path).map_err(|e| SyncError::Export {
                    artifact: file.name.clone(),
                    message: format!("cannot read attachment: {e}"),
                })?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                let payload = json!({
                    "request": {
                        "event_id": event_id,
                        "category": attribute.category,
                        "type": "malware-sample",
                        "comment": attribute.comment,
                        "files": [ { "filename": file.name, "data": encoded } ],
                    }
                });
                client.upload_sample(payload).await.map_err(|e| SyncError::Export {
                    artifact: file.name.clone(),
                    message: export_error_message(&e),
                })?;
            }
        }
        Ok(())
    }
}

fn attribute_payload(attribute: &ExportedAttribute) -> Value {
    match &attribute.value {
        ExportValue::Data(v) => json!({
            "category": attribute.category,
            "type": attribute.attr_type,
            "value": v,
            "comment": attribute.comment,
        }),
        ExportValue::Attachment(file) => json!({
            "category": attribute.category,
            "type": attribute.attr_type,
            "value": file.name,
            "comment": attribute.comment,
        }),
    }
}

fn export_value_key(value: &ExportValue) -> String {
    match value {
        ExportValue::Data(v) => v.clone(),
        ExportValue::Attachment(file) => file.name.clone(),
    }
}

fn exported_attribute_label(attribute: &ExportedAttribute) -> String {
    format!("{}:{}", attribute.attr_type, export_value_key(&attribute.value))
}

fn artifact_label(artifact: &Artifact) -> String {
    let value = match &artifact.value {
        ArtifactValue::Data(v) => v.clone(),
        ArtifactValue::Attachment(file) => file.name.clone(),
        ArtifactValue::RemoteAttachment { filename, .. } => filename.clone(),
    };
    format!("{}:{}", artifact.data_type, value)
}

/// Assembles the MISP-facing error message from the rejected response
/// per spec §4.6 step 5: `"<message> <error>"` when the response body
/// carries both fields, either one alone, or the raw status/body text
/// as a fallback when the body doesn't parse as the expected shape.
fn export_error_message(error: &SyncError) -> String {
    if let SyncError::Fetch { message, body, .. } = error {
        if let Some(body) = body {
            let response_message = body.get("message").and_then(Value::as_str);
            let response_error = body.get("error").and_then(Value::as_str);
            return match (response_message, response_error) {
                (Some(m), Some(e)) => format!("{m} {e}"),
                (Some(m), None) => m.to_string(),
                (None, Some(e)) => e.to_string(),
                (None, None) => message.clone(),
            };
        }
        return message.clone();
    }
    error.to_string()
}

/// Builds one `ExportedAttribute` per case artifact via the taxonomy
/// table. Inline artifacts map to `Data`; file artifacts map to
/// `Attachment`. A `RemoteAttachment` on a case artifact is an invariant
/// violation (it is an ingestion-only representation) and errors.
fn build_exported_attributes(artifacts: &[Artifact]) -> SyncResult<Vec<ExportedAttribute>> {
    artifacts
        .iter()
        .map(|artifact| match &artifact.value {
            ArtifactValue::Data(v) => {
                let (category, attr_type) = data_type_to_misp(&artifact.data_type, Some(v));
                Ok(ExportedAttribute {
                    category: category.to_string(),
                    attr_type: attr_type.to_string(),
                    value: ExportValue::Data(v.clone()),
                    comment: artifact.message.clone().unwrap_or_default(),
                })
            }
            ArtifactValue::Attachment(file) => {
                let (category, attr_type) = data_type_to_misp("file", None);
                Ok(ExportedAttribute {
                    category: category.to_string(),
                    attr_type: attr_type.to_string(),
                    value: ExportValue::Attachment(file.clone()),
                    comment: artifact.message.clone().unwrap_or_default(),
                })
            }
            ArtifactValue::RemoteAttachment { .. } => Err(SyncError::Export {
                artifact: artifact_label(artifact),
                message: "case artifact carries a remote attachment reference, which cannot be exported".to_string(),
            }),
        })
        .collect()
}

/// Keeps the *last* occurrence of each `(category, type, value)` triple,
/// per spec §9's adopted reading of the duplicate rule.
fn deduplicate(candidates: Vec<ExportedAttribute>) -> Vec<ExportedAttribute> {
    let mut by_key: Vec<(String, ExportedAttribute)> = Vec::new();
    for candidate in candidates {
        let key = format!("{}\u{0}{}\u{0}{}", candidate.category, candidate.attr_type, export_value_key(&candidate.value));
        if let Some(slot) = by_key.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = candidate;
        } else {
            by_key.push((key, candidate));
        }
    }
    by_key.into_iter().map(|(_, a)| a).collect()
}

fn to_artifact(attribute: &ExportedAttribute) -> Artifact {
    let data_type = crate::taxonomy::misp_type_to_data_type(&attribute.attr_type);
    let value = match &attribute.value {
        ExportValue::Data(v) => ArtifactValue::Data(v.clone()),
        ExportValue::Attachment(file) => ArtifactValue::Attachment(file.clone()),
    };
    Artifact {
        data_type: data_type.to_string(),
        value,
        tags: vec![],
        tlp: 2,
        message: if attribute.comment.is_empty() { None } else { Some(attribute.comment.clone()) },
        start_date: None,
    }
}

/// Parses `errors.Attribute` as a map of index -> `{value: [msg]}`. Any
/// unexpected shape is treated as "no errors recorded" per spec §9.
fn parse_attribute_error_indices(response: &Value) -> HashSet<usize> {
    response
        .get("errors")
        .and_then(|e| e.get("Attribute"))
        .and_then(Value::as_object)
        .map(|obj| obj.keys().filter_map(|k| k.parse::<usize>().ok()).collect())
        .unwrap_or_default()
}
