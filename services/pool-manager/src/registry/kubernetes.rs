//! Kubernetes-backed worker registry.
//!
//! Workers are pods in a fixed namespace, labelled `app=mc-worker` and
//! `status=<Waiting|Running>`. Reads are served from a reflector cache fed
//! by a long-lived watch; the same watch drives change notifications, so an
//! evicted pod triggers a reconcile instead of silently shrinking the pool.
//!
//! The cache is eventually consistent. Writes made through this registry
//! are overlaid on it until the watch reports them back, so a reconcile
//! pass that runs between a create and its watch event does not see a
//! stale pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use mc_id::WorkerId;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    cancellable, ChangeNotify, RegistryError, RegistryResult, Worker, WorkerRegistry,
    WorkerStatus,
};
use crate::shutdown::Shutdown;

/// Default namespace holding worker pods.
pub const DEFAULT_NAMESPACE: &str = "musicalchairs";

/// Label key identifying pods managed by this service.
pub const APP_LABEL: &str = "app";

/// Label value identifying pods managed by this service.
pub const APP_NAME: &str = "mc-worker";

/// Label key holding the worker status.
pub const STATUS_LABEL: &str = "status";

/// How long a local write is overlaid on the cache before it is dropped.
const OVERLAY_TTL: Duration = Duration::from_secs(60);

/// Pod template used to materialize a worker.
#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    /// Container image.
    pub image: String,

    /// Container entry command.
    pub command: Vec<String>,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            image: "alpine".to_string(),
            command: vec!["sleep".to_string(), "3000".to_string()],
        }
    }
}

impl WorkerTemplate {
    /// Build the pod manifest for a new `Waiting` worker.
    pub fn pod(&self, id: &WorkerId) -> Pod {
        let labels = BTreeMap::from([
            (APP_LABEL.to_string(), APP_NAME.to_string()),
            (
                STATUS_LABEL.to_string(),
                WorkerStatus::Waiting.as_str().to_string(),
            ),
        ]);

        Pod {
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: APP_NAME.to_string(),
                    image: Some(self.image.clone()),
                    command: (!self.command.is_empty()).then(|| self.command.clone()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Kubernetes backend configuration.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Namespace holding worker pods.
    pub namespace: String,

    /// Pod template for new workers.
    pub template: WorkerTemplate,

    /// How long to wait for the initial cache sync at startup.
    pub sync_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            template: WorkerTemplate::default(),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker registry backed by pods.
pub struct KubernetesRegistry {
    api: Api<Pod>,
    store: Store<Pod>,
    template: WorkerTemplate,
    shared: Arc<Shared>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl KubernetesRegistry {
    /// Connect using ambient credentials (kubeconfig or in-cluster) and
    /// wait for the initial cache sync.
    ///
    /// The watch runs until `shutdown` fires.
    pub async fn connect(config: KubernetesConfig, shutdown: Shutdown) -> RegistryResult<Self> {
        let client = Client::try_default().await?;
        Self::with_client(client, config, shutdown).await
    }

    /// Build the registry from an existing client.
    pub async fn with_client(
        client: Client,
        config: KubernetesConfig,
        shutdown: Shutdown,
    ) -> RegistryResult<Self> {
        info!(namespace = %config.namespace, "Starting worker pod watch");

        let api: Api<Pod> = Api::namespaced(client, &config.namespace);
        let (store, writer) = reflector::store::<Pod>();
        let watch_config = watcher::Config::default().labels(&app_selector());
        let stream = reflector(writer, watcher(api.clone(), watch_config)).default_backoff();

        let shared = Arc::new(Shared::default());
        let watch_task = tokio::spawn(run_watch(stream, Arc::clone(&shared), shutdown));

        match tokio::time::timeout(config.sync_timeout, store.wait_until_ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                watch_task.abort();
                return Err(RegistryError::Backend(format!("pod cache never synced: {e}")));
            }
            Err(_) => {
                watch_task.abort();
                return Err(RegistryError::Backend(format!(
                    "pod cache did not sync within {:?}",
                    config.sync_timeout
                )));
            }
        }

        info!(cached_pods = store.state().len(), "Worker pod cache synced");

        Ok(Self {
            api,
            store,
            template: config.template,
            shared,
            watch_task: Mutex::new(Some(watch_task)),
        })
    }

    fn overlay(&self) -> MutexGuard<'_, Overlay> {
        self.shared.overlay()
    }

    fn cached(&self, name: &str) -> Option<Arc<Pod>> {
        self.store
            .state()
            .into_iter()
            .find(|pod| pod.metadata.name.as_deref() == Some(name))
    }
}

fn app_selector() -> String {
    format!("{APP_LABEL}={APP_NAME}")
}

/// Whether a pod still counts as a live worker.
///
/// Terminating pods and pods in a terminal phase (including evicted pods)
/// are not.
fn is_live(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

fn label_status(pod: &Pod) -> Option<WorkerStatus> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(STATUS_LABEL))
        .and_then(|s| s.parse().ok())
}

fn map_kube_error(e: kube::Error, id: &WorkerId) -> RegistryError {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => RegistryError::NotFound(id.clone()),
        kube::Error::Api(ref resp) if resp.code == 409 => RegistryError::AlreadyExists(id.clone()),
        other => RegistryError::Backend(other.to_string()),
    }
}

// =============================================================================
// Local write overlay
// =============================================================================

/// Writes not yet reflected by the watch.
#[derive(Debug, Default)]
struct Overlay {
    created: HashMap<String, (DateTime<Utc>, Instant)>,
    deleted: HashMap<String, Instant>,
    relabeled: HashMap<String, (WorkerStatus, Instant)>,
}

impl Overlay {
    fn expire(&mut self, now: Instant) {
        self.created
            .retain(|_, (_, at)| now.duration_since(*at) < OVERLAY_TTL);
        self.deleted.retain(|_, at| now.duration_since(*at) < OVERLAY_TTL);
        self.relabeled
            .retain(|_, (_, at)| now.duration_since(*at) < OVERLAY_TTL);
    }

    /// The watch reported the current state of a pod.
    fn observe_apply(&mut self, pod: &Pod) {
        let Some(name) = pod.metadata.name.as_deref() else {
            return;
        };
        self.created.remove(name);
        if pod.metadata.deletion_timestamp.is_some() {
            self.deleted.remove(name);
        }
        if let Some((status, _)) = self.relabeled.get(name) {
            if label_status(pod) == Some(*status) {
                self.relabeled.remove(name);
            }
        }
    }

    /// The watch reported a pod gone.
    fn observe_delete(&mut self, name: &str) {
        self.created.remove(name);
        self.deleted.remove(name);
        self.relabeled.remove(name);
    }

    /// Merge cached pods with pending local writes.
    fn merge<'a, I>(&self, pods: I, wanted: WorkerStatus) -> Vec<Worker>
    where
        I: IntoIterator<Item = &'a Pod>,
    {
        let mut seen = HashSet::new();
        let mut workers = Vec::new();

        for pod in pods {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            seen.insert(name.to_string());

            if self.deleted.contains_key(name) || !is_live(pod) {
                continue;
            }

            let status = match self.relabeled.get(name) {
                Some((status, _)) => Some(*status),
                None => label_status(pod),
            };
            if status != Some(wanted) {
                continue;
            }

            match WorkerId::parse(name) {
                Ok(id) => workers.push(Worker {
                    id,
                    status: wanted,
                    created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
                }),
                Err(e) => debug!(pod = name, error = %e, "Skipping pod with unusable name"),
            }
        }

        for (name, (created_at, _)) in &self.created {
            if seen.contains(name) || self.deleted.contains_key(name) {
                continue;
            }
            let status = self
                .relabeled
                .get(name)
                .map(|(s, _)| *s)
                .unwrap_or(WorkerStatus::Waiting);
            if status != wanted {
                continue;
            }
            if let Ok(id) = WorkerId::parse(name) {
                workers.push(Worker {
                    id,
                    status,
                    created_at: Some(*created_at),
                });
            }
        }

        workers
    }
}

// =============================================================================
// Watch
// =============================================================================

/// State shared between the registry and its watch task.
#[derive(Default)]
struct Shared {
    listeners: RwLock<Vec<ChangeNotify>>,
    overlay: Mutex<Overlay>,
}

impl Shared {
    fn overlay(&self) -> MutexGuard<'_, Overlay> {
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener();
        }
    }
}

/// Kind of change observed through the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PodChange {
    Added(String),
    Updated(String),
    Deleted(String),
    /// A full relist completed; anything may have changed while disconnected.
    Resynced(usize),
}

/// Turns raw watch events into pod changes.
#[derive(Debug, Default)]
struct ChangeTracker {
    known: HashSet<String>,
    relist: Option<HashSet<String>>,
}

impl ChangeTracker {
    fn observe(&mut self, event: &watcher::Event<Pod>) -> Option<PodChange> {
        match event {
            watcher::Event::Apply(pod) => {
                let name = pod.metadata.name.clone()?;
                if self.known.insert(name.clone()) {
                    Some(PodChange::Added(name))
                } else {
                    Some(PodChange::Updated(name))
                }
            }
            watcher::Event::Delete(pod) => {
                let name = pod.metadata.name.clone()?;
                self.known.remove(&name);
                Some(PodChange::Deleted(name))
            }
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                None
            }
            watcher::Event::InitApply(pod) => {
                if let (Some(relist), Some(name)) = (self.relist.as_mut(), &pod.metadata.name) {
                    relist.insert(name.clone());
                }
                None
            }
            watcher::Event::InitDone => {
                let relisted = self.relist.take().unwrap_or_default();
                self.known = relisted;
                Some(PodChange::Resynced(self.known.len()))
            }
        }
    }
}

#[instrument(skip_all)]
async fn run_watch<S>(stream: S, shared: Arc<Shared>, mut shutdown: Shutdown)
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut tracker = ChangeTracker::default();

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                info!("Worker pod watch shutting down");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    match &event {
                        watcher::Event::Apply(pod) => shared.overlay().observe_apply(pod),
                        watcher::Event::Delete(pod) => {
                            if let Some(name) = pod.metadata.name.as_deref() {
                                shared.overlay().observe_delete(name);
                            }
                        }
                        _ => {}
                    }

                    if let Some(change) = tracker.observe(&event) {
                        debug!(?change, "Observed worker pod change");
                        shared.notify();
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Worker pod watch error, backing off");
                }
                None => {
                    warn!("Worker pod watch stream ended");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Registry implementation
// =============================================================================

#[async_trait]
impl WorkerRegistry for KubernetesRegistry {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn list_by_status(
        &self,
        cancel: &Shutdown,
        status: WorkerStatus,
    ) -> RegistryResult<Vec<Worker>> {
        cancellable(cancel, async {
            let pods = self.store.state();
            let mut overlay = self.overlay();
            overlay.expire(Instant::now());
            Ok(overlay.merge(pods.iter().map(|p| p.as_ref()), status))
        })
        .await
    }

    async fn create(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        let pod = self.template.pod(id);
        cancellable(cancel, async {
            info!(worker_id = %id, "Creating worker pod");
            self.api
                .create(&PostParams::default(), &pod)
                .await
                .map_err(|e| map_kube_error(e, id))?;
            // The watch clears overlay entries under this lock once the cache holds the pod.
            let mut overlay = self.overlay();
            if self.cached(id.as_str()).is_none() {
                overlay
                    .created
                    .insert(id.to_string(), (Utc::now(), Instant::now()));
            }
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        cancel: &Shutdown,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> RegistryResult<()> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": {
                    STATUS_LABEL: status.as_str(),
                }
            }
        });
        cancellable(cancel, async {
            self.api
                .patch(id.as_str(), &PatchParams::default(), &Patch::Strategic(&patch))
                .await
                .map_err(|e| map_kube_error(e, id))?;
            let mut overlay = self.overlay();
            let observed = self
                .cached(id.as_str())
                .is_some_and(|pod| label_status(&pod) == Some(status));
            if !observed {
                overlay
                    .relabeled
                    .insert(id.to_string(), (status, Instant::now()));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        cancellable(cancel, async {
            info!(worker_id = %id, "Deleting worker pod");
            self.api
                .delete(id.as_str(), &DeleteParams::default())
                .await
                .map_err(|e| map_kube_error(e, id))?;
            self.overlay()
                .deleted
                .insert(id.to_string(), Instant::now());
            Ok(())
        })
        .await
    }

    fn on_change(&self, notify: ChangeNotify) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notify);
    }

    async fn health_check(&self, cancel: &Shutdown) -> RegistryResult<()> {
        cancellable(cancel, async {
            self.api
                .list_metadata(&ListParams::default().labels(&app_selector()).limit(1))
                .await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let handle = self
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker pod watch task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod(name: &str, status: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    (APP_LABEL.to_string(), APP_NAME.to_string()),
                    (STATUS_LABEL.to_string(), status.to_string()),
                ])),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: None,
        }
    }

    fn with_phase(mut pod: Pod, phase: &str) -> Pod {
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn names(workers: &[Worker]) -> Vec<String> {
        let mut names: Vec<_> = workers.iter().map(|w| w.id.to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_template_builds_labelled_pod() {
        let id = WorkerId::parse("mc-worker-sunny-otter").unwrap();
        let pod = WorkerTemplate::default().pod(&id);

        assert_eq!(pod.metadata.name.as_deref(), Some("mc-worker-sunny-otter"));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(APP_LABEL).map(String::as_str), Some(APP_NAME));
        assert_eq!(labels.get(STATUS_LABEL).map(String::as_str), Some("Waiting"));

        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("alpine"));
        assert_eq!(
            container.command.as_deref(),
            Some(&["sleep".to_string(), "3000".to_string()][..])
        );
    }

    #[test]
    fn test_terminal_and_terminating_pods_are_not_live() {
        assert!(is_live(&pod("a", "Waiting")));
        assert!(is_live(&with_phase(pod("a", "Waiting"), "Running")));
        assert!(!is_live(&with_phase(pod("a", "Waiting"), "Failed")));
        assert!(!is_live(&with_phase(pod("a", "Waiting"), "Succeeded")));

        let mut terminating = pod("a", "Waiting");
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(!is_live(&terminating));
    }

    #[test]
    fn test_merge_filters_by_status_label() {
        let pods = [pod("w1", "Waiting"), pod("w2", "Running"), pod("w3", "Bogus")];
        let overlay = Overlay::default();

        assert_eq!(names(&overlay.merge(&pods, WorkerStatus::Waiting)), ["w1"]);
        assert_eq!(names(&overlay.merge(&pods, WorkerStatus::Running)), ["w2"]);
    }

    #[test]
    fn test_merge_includes_created_until_observed() {
        let mut overlay = Overlay::default();
        overlay
            .created
            .insert("w2".to_string(), (Utc::now(), Instant::now()));

        let cached = [pod("w1", "Waiting")];
        assert_eq!(
            names(&overlay.merge(&cached, WorkerStatus::Waiting)),
            ["w1", "w2"]
        );

        // Once the watch reports it, the cache is authoritative.
        let observed = pod("w2", "Waiting");
        overlay.observe_apply(&observed);
        assert!(overlay.created.is_empty());
        let cached = [pod("w1", "Waiting"), observed];
        assert_eq!(
            names(&overlay.merge(&cached, WorkerStatus::Waiting)),
            ["w1", "w2"]
        );
    }

    #[test]
    fn test_merge_hides_deleted_and_applies_relabel() {
        let mut overlay = Overlay::default();
        overlay.deleted.insert("w1".to_string(), Instant::now());
        overlay
            .relabeled
            .insert("w2".to_string(), (WorkerStatus::Running, Instant::now()));

        let cached = [pod("w1", "Waiting"), pod("w2", "Waiting"), pod("w3", "Waiting")];
        assert_eq!(names(&overlay.merge(&cached, WorkerStatus::Waiting)), ["w3"]);
        assert_eq!(names(&overlay.merge(&cached, WorkerStatus::Running)), ["w2"]);

        // The relabel stays until the watch shows the new label.
        overlay.observe_apply(&pod("w2", "Waiting"));
        assert!(overlay.relabeled.contains_key("w2"));
        overlay.observe_apply(&pod("w2", "Running"));
        assert!(!overlay.relabeled.contains_key("w2"));

        overlay.observe_delete("w1");
        assert!(overlay.deleted.is_empty());
    }

    #[test]
    fn test_overlay_entries_expire() {
        let mut overlay = Overlay::default();
        let start = Instant::now();
        overlay
            .created
            .insert("w1".to_string(), (Utc::now(), start));
        overlay.deleted.insert("w2".to_string(), start);

        overlay.expire(start + OVERLAY_TTL + Duration::from_secs(1));
        assert!(overlay.created.is_empty());
        assert!(overlay.deleted.is_empty());
    }

    #[test]
    fn test_change_tracker_classifies_events() {
        let mut tracker = ChangeTracker::default();

        assert_eq!(tracker.observe(&watcher::Event::Init), None);
        assert_eq!(
            tracker.observe(&watcher::Event::InitApply(pod("w1", "Waiting"))),
            None
        );
        assert_eq!(
            tracker.observe(&watcher::Event::InitDone),
            Some(PodChange::Resynced(1))
        );

        assert_eq!(
            tracker.observe(&watcher::Event::Apply(pod("w1", "Running"))),
            Some(PodChange::Updated("w1".to_string()))
        );
        assert_eq!(
            tracker.observe(&watcher::Event::Apply(pod("w2", "Waiting"))),
            Some(PodChange::Added("w2".to_string()))
        );
        assert_eq!(
            tracker.observe(&watcher::Event::Delete(pod("w1", "Running"))),
            Some(PodChange::Deleted("w1".to_string()))
        );
        assert!(!tracker.known.contains("w1"));
    }

    #[test]
    fn test_map_kube_error_codes() {
        let id = WorkerId::parse("w1").unwrap();
        let api_err = |code: u16| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "Test".to_string(),
                code,
            })
        };

        assert!(map_kube_error(api_err(404), &id).is_not_found());
        assert!(matches!(
            map_kube_error(api_err(409), &id),
            RegistryError::AlreadyExists(_)
        ));
        assert!(matches!(
            map_kube_error(api_err(500), &id),
            RegistryError::Backend(_)
        ));
    }
}
