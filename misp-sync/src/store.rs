//! Persistence and eventing contracts required of platform collaborators
//! (spec §6.4). The real platform owns these stores; this module defines
//! the narrow async trait surface the connector needs plus an in-memory
//! implementation of each, used by the demo wiring in `main.rs` and by
//! the pipeline test suites.

use crate::error::{SyncError, SyncResult};
use crate::model::{Alert, Artifact, Case};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get(&self, source: &str, source_ref: &str) -> SyncResult<Option<Alert>>;
    /// All alerts for one instance, used to compute the ingestion watermark.
    async fn find_by_source(&self, source: &str) -> SyncResult<Vec<Alert>>;
    /// All `type=misp` alerts, used by the backfill worker.
    async fn find_all(&self) -> SyncResult<Vec<Alert>>;
    async fn create(&self, alert: Alert) -> SyncResult<Alert>;
    async fn update(&self, alert: Alert) -> SyncResult<Alert>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn get(&self, id: &str) -> SyncResult<Option<Case>>;
    async fn update(&self, case: Case) -> SyncResult<Case>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn append(&self, case_id: &str, artifacts: Vec<Artifact>) -> SyncResult<()>;
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn source(&self, attachment_id: &str) -> SyncResult<Vec<u8>>;
}

/// Temporary files are process-wide and bulk-released at cycle boundaries
/// (spec §5's "shared resources"), so a crash mid-cycle still releases on
/// the next cycle's boundary rather than leaking per-file.
pub trait TempStore: Send + Sync {
    fn new_temporary_file(&self, prefix: &str, name: &str) -> SyncResult<PathBuf>;
    fn release_all(&self) -> SyncResult<()>;
}

#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// Fired to request re-hydration of MISP alerts with empty artifact arrays.
    UpdateMispAlertArtifact,
}

/// Actor-based backfill listener, modeled as a subscription callback on a
/// channel-backed event bus (spec §9's translation of the original
/// actor pattern).
pub struct EventBus {
    sender: mpsc::UnboundedSender<DomainEvent>,
    receiver: RwLock<Option<mpsc::UnboundedReceiver<DomainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: RwLock::new(Some(receiver)),
        }
    }

    pub fn publish(&self, event: DomainEvent) {
        // A full receiver is only absent if take_receiver was already
        // called and no listener is running; dropping the event is the
        // right degradation for an optional backfill listener.
        let _ = self.sender.send(event);
    }

    pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<DomainEvent>> {
        self.receiver.write().await.take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: RwLock<HashMap<String, Alert>>,
}

fn alert_key(source: &str, source_ref: &str) -> String {
    format!("{source}:{source_ref}")
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn get(&self, source: &str, source_ref: &str) -> SyncResult<Option<Alert>> {
        Ok(self.alerts.read().await.get(&alert_key(source, source_ref)).cloned())
    }

    async fn find_by_source(&self, source: &str) -> SyncResult<Vec<Alert>> {
        Ok(self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| a.source == source)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> SyncResult<Vec<Alert>> {
        Ok(self.alerts.read().await.values().cloned().collect())
    }

    async fn create(&self, alert: Alert) -> SyncResult<Alert> {
        let key = alert_key(&alert.source, &alert.source_ref);
        let mut alerts = self.alerts.write().await;
        if alerts.contains_key(&key) {
            return Err(SyncError::Persistence(format!(
                "alert for ({}, {}) already exists",
                alert.source, alert.source_ref
            )));
        }
        alerts.insert(key, alert.clone());
        Ok(alert)
    }

    async fn update(&self, alert: Alert) -> SyncResult<Alert> {
        let key = alert_key(&alert.source, &alert.source_ref);
        let mut alerts = self.alerts.write().await;
        alerts.insert(key, alert.clone());
        Ok(alert)
    }
}

#[derive(Clone)]
pub struct InMemoryCaseStore {
    cases: Arc<RwLock<HashMap<String, Case>>>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self {
            cases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn seed(&self, case: Case) {
        self.cases.write().await.insert(case.id.clone(), case);
    }

    /// Backing map shared with an `InMemoryArtifactStore` bound to the
    /// same demo case set.
    pub fn shared(&self) -> Arc<RwLock<HashMap<String, Case>>> {
        Arc::clone(&self.cases)
    }
}

impl Default for InMemoryCaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn get(&self, id: &str) -> SyncResult<Option<Case>> {
        Ok(self.cases.read().await.get(id).cloned())
    }

    async fn update(&self, case: Case) -> SyncResult<Case> {
        self.cases.write().await.insert(case.id.clone(), case.clone());
        Ok(case)
    }
}

pub struct InMemoryArtifactStore {
    cases: Arc<RwLock<HashMap<String, Case>>>,
}

impl InMemoryArtifactStore {
    pub fn new(cases: Arc<RwLock<HashMap<String, Case>>>) -> Self {
        Self { cases }
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn append(&self, case_id: &str, artifacts: Vec<Artifact>) -> SyncResult<()> {
        let mut cases = self.cases.write().await;
        if let Some(case) = cases.get_mut(case_id) {
            case.artifacts.extend(artifacts);
        }
        Ok(())
    }
}

pub struct FilesystemTempStore {
    root: PathBuf,
    counter: AtomicU64,
}

impl FilesystemTempStore {
    pub fn new(root: PathBuf) -> SyncResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| SyncError::Persistence(format!("cannot create temp dir: {e}")))?;
        Ok(Self {
            root,
            counter: AtomicU64::new(0),
        })
    }
}

/// `name` comes from an untrusted remote (a `Content-Disposition` header
/// or a ZIP entry's content) and may carry path separators; only its
/// final component is used so the allocated path can never escape `root`.
fn sanitize_file_name(name: &str) -> std::borrow::Cow<'_, str> {
    match std::path::Path::new(name).file_name() {
        Some(f) if !f.is_empty() => f.to_string_lossy(),
        _ => std::borrow::Cow::Borrowed("unnamed"),
    }
}

impl TempStore for FilesystemTempStore {
    fn new_temporary_file(&self, prefix: &str, name: &str) -> SyncResult<PathBuf> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = sanitize_file_name(name);
        Ok(self.root.join(format!("{prefix}-{id}-{name}")))
    }

    fn release_all(&self) -> SyncResult<()> {
        for entry in std::fs::read_dir(&self.root)
            .map_err(|e| SyncError::Persistence(format!("cannot read temp dir: {e}")))?
        {
            let entry = entry.map_err(|e| SyncError::Persistence(e.to_string()))?;
            let _ = std::fs::remove_file(entry.path());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_file_name_strips_directory_components() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a/b.exe"), "b.exe");
        assert_eq!(sanitize_file_name("evil.exe"), "evil.exe");
    }

    #[test]
    fn sanitize_file_name_falls_back_for_degenerate_input() {
        assert_eq!(sanitize_file_name(".."), "unnamed");
        assert_eq!(sanitize_file_name("/"), "unnamed");
        assert_eq!(sanitize_file_name(""), "unnamed");
    }

    #[test]
    fn new_temporary_file_confines_path_traversal_attempts_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemTempStore::new(dir.path().join("work")).unwrap();

        let path = store.new_temporary_file("misp-download", "../../../etc/passwd").unwrap();

        assert_eq!(path.parent().unwrap(), dir.path().join("work"));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "misp-download-0-passwd");
    }
}
