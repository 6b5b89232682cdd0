//! Deadline-bounded readiness polling for a freshly deployed server
//!
//! [`ReadinessPoller::wait`] spawns one monitor task that observes the
//! workload every interval and races its success signal against the
//! deadline. The success signal is a `oneshot`, so a late send after the
//! deadline never blocks, and the monitor is cancelled explicitly when the
//! deadline wins.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
use mockall::automock;

/// Default interval between checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Readiness errors
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The deadline passed before the workload became ready
    #[error("timed out after {deadline:?} waiting for namespace {namespace} to become ready")]
    Timeout {
        /// Namespace being waited on
        namespace: String,
        /// Configured deadline
        deadline: Duration,
    },

    /// Observing the workload failed
    #[error("probe failed: {0}")]
    Probe(String),
}

/// Readiness of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    /// Pod name
    pub name: String,
    /// Ready condition is true
    pub ready: bool,
    /// Container images from the pod spec
    pub images: Vec<String>,
}

/// Snapshot of a deployment and its pods
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Deployment available replicas; 0 when the deployment is absent
    pub available_replicas: i32,
    /// Pods matching the workload
    pub pods: Vec<PodObservation>,
}

/// Why a check did not pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    /// Deployment reports no available replicas
    NoAvailableReplicas,
    /// No pod is ready
    NoReadyPods,
    /// Ready pods run a different image
    ImageMismatch {
        /// Image reference waited for
        expected: String,
        /// Images found on the first ready pod
        found: Vec<String>,
    },
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAvailableReplicas => write!(f, "deployment has no available replicas"),
            Self::NoReadyPods => write!(f, "no pod is ready"),
            Self::ImageMismatch { expected, found } => {
                write!(f, "expected image {}, found {}", expected, found.join(", "))
            }
        }
    }
}

/// Check an observation against the expected image reference
///
/// Ready means at least one available replica and a ready pod running
/// exactly `expected_image`.
pub fn evaluate(observation: &Observation, expected_image: &str) -> Result<(), NotReady> {
    if observation.available_replicas < 1 {
        return Err(NotReady::NoAvailableReplicas);
    }

    let mut ready = observation.pods.iter().filter(|p| p.ready).peekable();
    let first = match ready.peek() {
        Some(pod) => (*pod).clone(),
        None => return Err(NotReady::NoReadyPods),
    };

    if ready.any(|pod| pod.images.iter().any(|image| image == expected_image)) {
        return Ok(());
    }
    Err(NotReady::ImageMismatch {
        expected: expected_image.to_string(),
        found: first.images,
    })
}

/// Source of workload observations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadProbe: Send + Sync {
    /// Take one observation
    async fn observe(&self) -> Result<Observation, ReadinessError>;
}

/// Observes a Deployment and its pods through the Kubernetes API
pub struct KubeWorkloadProbe {
    client: Client,
    namespace: String,
    deployment: String,
    selector: Option<String>,
}

impl KubeWorkloadProbe {
    /// Probe `deployment` in `namespace`; pods are filtered by `selector` when given
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        deployment: impl Into<String>,
        selector: Option<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            deployment: deployment.into(),
            selector,
        }
    }
}

fn pod_observation(pod: &Pod) -> PodObservation {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    let images = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| c.image.clone())
                .collect()
        })
        .unwrap_or_default();

    PodObservation {
        name: pod.metadata.name.clone().unwrap_or_default(),
        ready,
        images,
    }
}

#[async_trait]
impl WorkloadProbe for KubeWorkloadProbe {
    async fn observe(&self) -> Result<Observation, ReadinessError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let available_replicas = match deployments.get_opt(&self.deployment).await {
            Ok(Some(deployment)) => deployment
                .status
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            Ok(None) => {
                trace!(deployment = %self.deployment, "deployment not found yet");
                0
            }
            Err(e) => {
                return Err(ReadinessError::Probe(format!(
                    "failed to get deployment {}: {}",
                    self.deployment, e
                )))
            }
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = ListParams::default();
        if let Some(selector) = &self.selector {
            params = params.labels(selector);
        }
        let pods = pods.list(&params).await.map_err(|e| {
            ReadinessError::Probe(format!(
                "failed to list pods in {}: {}",
                self.namespace, e
            ))
        })?;

        Ok(Observation {
            available_replicas,
            pods: pods.items.iter().map(pod_observation).collect(),
        })
    }
}

/// Where a wait stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Checks are running
    Polling,
    /// A check passed
    Succeeded,
    /// The deadline passed first
    TimedOut,
}

/// Waits for a workload to run an expected image, bounded by a deadline
pub struct ReadinessPoller {
    probe: Arc<dyn WorkloadProbe>,
    namespace: String,
    expected_image: String,
    timeout: Duration,
    interval: Duration,
    state: watch::Sender<ReadinessState>,
}

impl ReadinessPoller {
    /// Poll `probe` until it reports `expected_image` ready or `timeout` passes
    pub fn new(
        probe: Arc<dyn WorkloadProbe>,
        namespace: impl Into<String>,
        expected_image: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ReadinessState::Polling);
        Self {
            probe,
            namespace: namespace.into(),
            expected_image: expected_image.into(),
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
            state,
        }
    }

    /// Override the check interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Current state
    pub fn state(&self) -> ReadinessState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state.subscribe()
    }

    /// Block until ready or the deadline passes
    ///
    /// Returns no earlier than the deadline on timeout, and the monitor task
    /// has stopped by the time this returns.
    pub async fn wait(&self) -> Result<(), ReadinessError> {
        self.state.send_replace(ReadinessState::Polling);
        let deadline = tokio::time::Instant::now() + self.timeout;

        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            self.probe.clone(),
            self.expected_image.clone(),
            self.interval,
            ready_tx,
            cancel.clone(),
        ));

        let outcome = tokio::time::timeout_at(deadline, ready_rx).await;
        cancel.cancel();
        let joined = monitor.await;
        if let Err(e) = &joined {
            warn!(namespace = %self.namespace, error = %e, "readiness monitor failed");
        }

        match outcome {
            Ok(Ok(())) => {
                self.state.send_replace(ReadinessState::Succeeded);
                info!(namespace = %self.namespace, image = %self.expected_image, "workload is ready");
                Ok(())
            }
            Ok(Err(_)) => {
                self.state.send_replace(ReadinessState::TimedOut);
                Err(ReadinessError::Probe(match joined {
                    Err(e) => format!("readiness monitor failed: {}", e),
                    Ok(()) => "monitor stopped without a result".to_string(),
                }))
            }
            Err(_) => {
                self.state.send_replace(ReadinessState::TimedOut);
                Err(ReadinessError::Timeout {
                    namespace: self.namespace.clone(),
                    deadline: self.timeout,
                })
            }
        }
    }
}

async fn monitor(
    probe: Arc<dyn WorkloadProbe>,
    expected_image: String,
    interval: Duration,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let observation = tokio::select! {
            _ = cancel.cancelled() => return,
            observation = probe.observe() => observation,
        };

        match observation.map(|o| evaluate(&o, &expected_image)) {
            Ok(Ok(())) => {
                let _ = ready.send(());
                return;
            }
            Ok(Err(reason)) => debug!(%reason, "not ready yet"),
            Err(e) => debug!(error = %e, "readiness check failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
