//! Session states and the transition function.
//!
//! Each cluster operation dispatched by a session completes with exactly one
//! [`Outcome`]. [`next_state`] maps `(state, outcome)` to the following state
//! without side effects; the session actor performs the entry action of the
//! state it lands in.

use std::fmt;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use crate::cluster::{is_running, ClusterError, PodReadiness};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unknown,
    FetchingPod,
    FetchingPvc,
    CreatingPvc,
    WaitingForPvc,
    CreatingPod,
    WaitingForPod,
    WaitingForInitContainer,
    PodRunning,
    PodTerminated,
    Error,
}

impl State {
    /// Progress label shown to the connecting user. Empty for states that
    /// have their own screen.
    pub fn label(self) -> &'static str {
        match self {
            State::FetchingPod => "Communicating to the Kubernetes cluster",
            State::FetchingPvc => "Fetching volume",
            State::CreatingPvc => "Creating volume",
            State::WaitingForPvc => "Waiting for volume to be ready",
            State::CreatingPod => "Creating pod",
            State::WaitingForPod => "Waiting for pod to be ready",
            State::WaitingForInitContainer => "Waiting for setup to complete",
            State::PodRunning => "Attaching to pod...",
            State::Unknown | State::PodTerminated | State::Error => "",
        }
    }

    /// True for states that only end when the connection closes.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::PodTerminated | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Unknown => "unknown",
            State::FetchingPod => "fetching-pod",
            State::FetchingPvc => "fetching-pvc",
            State::CreatingPvc => "creating-pvc",
            State::WaitingForPvc => "waiting-for-pvc",
            State::CreatingPod => "creating-pod",
            State::WaitingForPod => "waiting-for-pod",
            State::WaitingForInitContainer => "waiting-for-init-container",
            State::PodRunning => "pod-running",
            State::PodTerminated => "pod-terminated",
            State::Error => "error",
        };
        f.write_str(name)
    }
}

/// Result of a watch-style wait.
#[derive(Debug)]
pub enum WatchResult {
    VolumeReady,
    PodPhase(PodReadiness),
}

/// Which long-running stream finished.
#[derive(Debug)]
pub enum StreamEnd {
    /// The init-container log tail closed cleanly.
    LogTail,
    /// The interactive shell ended, cleanly or not.
    Attach(Result<(), ClusterError>),
}

/// Completion message of the single in-flight cluster operation.
#[derive(Debug)]
pub enum Outcome {
    PodFetched(Option<Pod>),
    VolumeFetched(Option<PersistentVolumeClaim>),
    VolumeCreated(PersistentVolumeClaim),
    PodCreated(Pod),
    WatchEvent(WatchResult),
    StreamEnded(StreamEnd),
    Failed(ClusterError),
}

/// Transition function of the session state machine.
///
/// Create conflicts re-enter the matching fetch state. Any outcome that does
/// not belong to the current state lands in [`State::Error`]. The session
/// runs teardown evaluation before applying an attach end, clean or not.
pub fn next_state(state: State, outcome: &Outcome) -> State {
    use Outcome as O;
    use State as S;

    match (state, outcome) {
        (S::FetchingPod, O::PodFetched(None)) => S::FetchingPvc,
        (S::FetchingPod, O::PodFetched(Some(pod))) if is_running(pod) => S::PodRunning,
        (S::FetchingPod, O::PodFetched(Some(_))) => S::WaitingForPod,

        (S::FetchingPvc, O::VolumeFetched(None)) => S::CreatingPvc,
        (S::FetchingPvc, O::VolumeFetched(Some(_))) => S::CreatingPod,

        (S::CreatingPvc, O::VolumeCreated(_)) => S::WaitingForPvc,
        (S::CreatingPvc, O::Failed(e)) if e.is_already_exists() => S::FetchingPvc,

        (S::WaitingForPvc, O::WatchEvent(WatchResult::VolumeReady)) => S::CreatingPod,

        (S::CreatingPod, O::PodCreated(_)) => S::WaitingForPod,
        (S::CreatingPod, O::Failed(e)) if e.is_already_exists() => S::FetchingPod,

        (S::WaitingForPod, O::WatchEvent(WatchResult::PodPhase(PodReadiness::Ready))) => {
            S::PodRunning
        }
        (
            S::WaitingForPod,
            O::WatchEvent(WatchResult::PodPhase(PodReadiness::InitContainerRunning)),
        ) => S::WaitingForInitContainer,

        (S::WaitingForInitContainer, O::StreamEnded(StreamEnd::LogTail)) => S::WaitingForPod,

        (S::PodRunning, O::StreamEnded(StreamEnd::Attach(Ok(())))) => S::PodTerminated,

        _ => S::Error,
    }
}
