//! Cluster resource client.
//!
//! [`ClusterApi`] is the seam between the session state machine and the
//! orchestration API. Every method is one self-contained request or stream,
//! so a single client instance is shared by all sessions. [`KubeCluster`] is
//! the production implementation; tests substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use tokio::sync::mpsc;

use crate::terminal::ResizeReceiver;

pub mod kube;
pub mod logs;
pub mod pod_spec;

pub use self::kube::KubeCluster;

/// Name of the provisioning init container in every user pod.
pub const INIT_CONTAINER: &str = "init";

/// Number of log lines replayed when a log tail starts.
pub const LOG_TAIL_SEED_LINES: i64 = 100;

/// Counts the pseudoterminals currently allocated inside a pod.
pub const COUNT_PTYS_COMMAND: [&str; 3] = ["/bin/sh", "-c", "find /dev/pts -group tty | wc -l"];

/// Writes a shutdown notice to every pseudoterminal inside a pod.
pub const SHUTDOWN_NOTICE_COMMAND: [&str; 3] = [
    "/bin/sh",
    "-c",
    "for pty in $(find /dev/pts -group tty); do printf '\\n###########################\\n The system is going down! \\n\\n' > $pty; done",
];

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("cluster API error: {0}")]
    Api(#[source] ::kube::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {after:?} while {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("pod failed: {reason}")]
    PodFailed { reason: String },

    #[error("pod {name} was deleted")]
    PodDeleted { name: String },

    #[error("pod {name} has terminated (phase {phase}); reconnect to start a new one")]
    PodTerminated { name: String, phase: String },

    #[error("pod {name} has no containers")]
    MissingContainer { name: String },

    #[error("unexpected command output: {0:?}")]
    UnexpectedOutput(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("no {0} is known for this session")]
    NotTracked(&'static str),

    #[error("unexpected result while {0}")]
    UnexpectedOutcome(String),
}

impl ClusterError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Readiness of a user pod, as observed through a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodReadiness {
    /// Nothing decisive observed yet.
    Unknown,
    /// The provisioning init container is running; its logs can be tailed.
    InitContainerRunning,
    /// The shell container passed its readiness probe; safe to attach.
    Ready,
}

impl PodReadiness {
    /// Classify a pod snapshot.
    ///
    /// A running init container wins over readiness, matching the order in
    /// which the two conditions can occur. A failed pod is an error.
    pub fn observe(pod: &Pod) -> Result<Self, ClusterError> {
        let Some(status) = pod.status.as_ref() else {
            return Ok(Self::Unknown);
        };

        if status.phase.as_deref() == Some("Failed") {
            let reason = status
                .message
                .clone()
                .or_else(|| status.reason.clone())
                .unwrap_or_else(|| "pod entered the Failed phase".to_string());
            return Err(ClusterError::PodFailed { reason });
        }

        let init_running = status
            .init_container_statuses
            .iter()
            .flatten()
            .any(|s| {
                s.name == INIT_CONTAINER
                    && s.state.as_ref().and_then(|st| st.running.as_ref()).is_some()
            });
        if init_running {
            return Ok(Self::InitContainerRunning);
        }

        if is_ready(pod) {
            return Ok(Self::Ready);
        }
        Ok(Self::Unknown)
    }

    /// Once the init container's log has been followed to its end, a status
    /// that still shows it running is stale and decides nothing.
    pub fn after_init_logged(self, init_logged: bool) -> Self {
        match self {
            Self::InitContainerRunning if init_logged => Self::Unknown,
            other => other,
        }
    }
}

/// True when the pod reports the `Ready` condition as `True`.
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// True when the pod is running and its shell container is ready.
pub fn is_running(pod: &Pod) -> bool {
    phase(pod) == Some("Running") && is_ready(pod)
}

/// Returns the phase of a pod that will never run again.
pub fn terminal_phase(pod: &Pod) -> Option<&str> {
    phase(pod).filter(|p| *p == "Failed" || *p == "Succeeded")
}

pub fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Name of the container exec and attach sessions run in.
pub fn primary_container(pod: &Pod) -> Result<&str, ClusterError> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.as_str())
        .ok_or_else(|| ClusterError::MissingContainer {
            name: pod_name(pod).to_string(),
        })
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn volume_name(pvc: &PersistentVolumeClaim) -> &str {
    pvc.metadata.name.as_deref().unwrap_or_default()
}

/// I/O wiring for an interactive attach.
pub struct AttachIo {
    /// Keystrokes from the connecting terminal.
    pub input: mpsc::UnboundedReceiver<Bytes>,
    /// Shell output destined for the connecting terminal.
    pub output: mpsc::Sender<Bytes>,
    /// Terminal-size updates, polled by the exec stream.
    pub resize: ResizeReceiver,
}

/// Operations against the orchestration API.
///
/// Implementations must be safe for concurrent use; every call is
/// independent. Waits and streams return when their condition is met or
/// their stream closes; callers bound them with timeouts and cancellation.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, ClusterError>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError>;

    async fn create_volume(&self, name: &str, size: &str)
        -> Result<PersistentVolumeClaim, ClusterError>;

    /// Create the user pod. `first_boot` selects the home-provisioning
    /// template over the steady-state one.
    async fn create_pod(
        &self,
        name: &str,
        image: &str,
        volume: &PersistentVolumeClaim,
        first_boot: bool,
    ) -> Result<Pod, ClusterError>;

    /// Block until the volume is added or modified.
    async fn wait_for_volume_ready(&self, volume: &PersistentVolumeClaim)
        -> Result<(), ClusterError>;

    /// Block until the init container runs or the pod becomes ready,
    /// whichever is observed first. Never returns [`PodReadiness::Unknown`].
    ///
    /// With `init_logged` set a running init container is not reported,
    /// see [`PodReadiness::after_init_logged`].
    async fn wait_for_pod_phase(
        &self,
        pod: &Pod,
        init_logged: bool,
    ) -> Result<PodReadiness, ClusterError>;

    /// Delete the pod. A pod that no longer exists counts as deleted.
    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError>;

    /// Follow a container's log, sending each decoded line to `sink` until
    /// the stream ends.
    async fn tail_logs(
        &self,
        pod: &Pod,
        container: &str,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), ClusterError>;

    /// Run a non-interactive command in the primary container and collect
    /// its standard output.
    async fn exec_in_pod(&self, pod: &Pod, command: &[&str]) -> Result<String, ClusterError>;

    /// Run `su - <username>` on a TTY in the primary container, wired to
    /// `io`, until the shell exits or the stream fails.
    async fn attach(&self, pod: &Pod, username: &str, io: AttachIo) -> Result<(), ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, PodCondition, PodSpec,
        PodStatus,
    };

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            metadata: Default::default(),
            spec: None,
            status: Some(status),
        }
    }

    fn running_init() -> Vec<ContainerStatus> {
        vec![ContainerStatus {
            name: INIT_CONTAINER.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    }

    fn ready_condition() -> Vec<PodCondition> {
        vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]
    }

    #[test]
    fn observe_without_status_is_unknown() {
        let pod = Pod::default();
        assert_eq!(PodReadiness::observe(&pod).unwrap(), PodReadiness::Unknown);
    }

    #[test]
    fn observe_running_init_container() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Pending".into()),
            init_container_statuses: Some(running_init()),
            ..Default::default()
        });
        assert_eq!(PodReadiness::observe(&pod).unwrap(), PodReadiness::InitContainerRunning);
    }

    #[test]
    fn observe_ready_pod() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Running".into()),
            conditions: Some(ready_condition()),
            ..Default::default()
        });
        assert_eq!(PodReadiness::observe(&pod).unwrap(), PodReadiness::Ready);
        assert!(is_running(&pod));
    }

    #[test]
    fn init_container_wins_when_both_reported() {
        let pod = pod_with_status(PodStatus {
            init_container_statuses: Some(running_init()),
            conditions: Some(ready_condition()),
            ..Default::default()
        });
        assert_eq!(PodReadiness::observe(&pod).unwrap(), PodReadiness::InitContainerRunning);
    }

    #[test]
    fn stale_init_status_is_ignored_once_logged() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Pending".into()),
            init_container_statuses: Some(running_init()),
            ..Default::default()
        });
        let observed = PodReadiness::observe(&pod).unwrap();
        assert_eq!(observed.after_init_logged(false), PodReadiness::InitContainerRunning);
        assert_eq!(observed.after_init_logged(true), PodReadiness::Unknown);
        assert_eq!(PodReadiness::Ready.after_init_logged(true), PodReadiness::Ready);
    }

    #[test]
    fn observe_failed_pod_is_error() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Failed".into()),
            reason: Some("Evicted".into()),
            ..Default::default()
        });
        let err = PodReadiness::observe(&pod).unwrap_err();
        assert!(matches!(err, ClusterError::PodFailed { ref reason } if reason == "Evicted"));
    }

    #[test]
    fn running_but_not_ready_is_not_running() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        assert!(!is_running(&pod));
        assert_eq!(terminal_phase(&pod), None);
    }

    #[test]
    fn terminal_phase_detects_finished_pods() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        assert_eq!(terminal_phase(&pod), Some("Succeeded"));
    }

    #[test]
    fn primary_container_is_first() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![
                    Container { name: "shell".into(), ..Default::default() },
                    Container { name: "dind".into(), ..Default::default() },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(primary_container(&pod).unwrap(), "shell");
        assert!(primary_container(&Pod::default()).is_err());
    }
}
