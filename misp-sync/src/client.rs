//! Thin per-instance HTTP wrapper around the MISP REST API (spec §4.4,
//! §6.2, §6.3). Grounded on the `misp_get`/`misp_post`/`handle_response`
//! shape used by similar MISP clients in the wild: every request carries
//! the instance's API key and JSON `Accept` header, and non-2xx
//! responses are converted into `SyncError::Fetch`.

use crate::error::{SyncError, SyncResult};
use crate::model::InstanceConfig;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct MispClient {
    http: Client,
    instance: InstanceConfig,
}

impl MispClient {
    pub fn new(http: Client, instance: InstanceConfig) -> Self {
        Self { http, instance }
    }

    pub fn instance(&self) -> &InstanceConfig {
        &self.instance
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.instance.base_url.trim_end_matches('/'), path)
    }

    async fn post_json(&self, path: &str, body: Value) -> SyncResult<Value> {
        let url = self.url(path);
        debug!(%url, "POST");
        trace!(body = %body, "request body");

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.instance.api_key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn handle_response(&self, response: Response) -> SyncResult<Value> {
        let status = response.status();
        let url = response.url().to_string();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).ok();
            return Err(SyncError::Fetch {
                endpoint: url,
                message: format!("{} {}", status, text),
                body,
            });
        }

        let text = response.text().await?;
        trace!(body = %text, "response body");
        serde_json::from_str(&text).map_err(|e| SyncError::Parse {
            what: url,
            message: e.to_string(),
        })
    }

    /// POST `events/index` — `{"searchpublish_timestamp": <sec>}`.
    pub async fn get_index_since(&self, timestamp_sec: i64) -> SyncResult<Value> {
        self.post_json(
            "events/index",
            json!({ "searchpublish_timestamp": timestamp_sec }),
        )
        .await
    }

    /// POST `attributes/restSearch/json` — `{"request": {"timestamp": <sec>, "eventid": <id>}}`.
    pub async fn get_attributes(&self, event_id: &str, since_sec: Option<i64>) -> SyncResult<Value> {
        let mut request = json!({ "eventid": event_id });
        if let Some(since) = since_sec {
            request["timestamp"] = json!(since);
        }
        self.post_json("attributes/restSearch/json", json!({ "request": request }))
            .await
    }

    /// POST `events`.
    pub async fn create_event(&self, event_json: Value) -> SyncResult<Value> {
        self.post_json("events", event_json).await
    }

    /// POST `attributes/add/{eventId}`.
    pub async fn add_attribute(&self, event_id: &str, attribute_json: Value) -> SyncResult<Value> {
        self.post_json(&format!("attributes/add/{}", event_id), attribute_json)
            .await
    }

    /// POST `events/upload_sample`.
    pub async fn upload_sample(&self, body: Value) -> SyncResult<Value> {
        self.post_json("events/upload_sample", body).await
    }

    /// GET `attributes/download/{id}`, returning the raw streaming response
    /// for `AttachmentHandler` to consume.
    pub async fn download_attribute(&self, id: &str) -> SyncResult<Response> {
        let url = self.url(&format!("attributes/download/{}", id));
        debug!(%url, "GET");

        let response = self
            .http
            .get(&url)
            .header("Authorization", &self.instance.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Fetch {
                endpoint: url,
                message: response.status().to_string(),
                body: None,
            });
        }
        Ok(response)
    }
}
