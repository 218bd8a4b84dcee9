//! Pod teardown evaluation.
//!
//! A user pod is deleted when the last terminal leaves it, or unconditionally
//! while the server is shutting down. "Terminals" are counted inside the pod:
//! the shell container owns one console PTY for its whole life, and every
//! attached session adds one more. A count of exactly one therefore means no
//! user is attached.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;

use crate::cluster::{pod_name, ClusterApi, ClusterError, COUNT_PTYS_COMMAND, SHUTDOWN_NOTICE_COMMAND};

/// PTY count of a pod with nobody attached.
pub const IDLE_PTY_COUNT: usize = 1;

/// What started the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// This session's interactive shell ended.
    AttachEnded,
    /// The connection went away.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The pod was deleted, or deletion was attempted and failed.
    Deleted { forced: bool },
    /// Other terminals remain attached.
    Kept { count: usize },
}

/// Tuning for a single evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TeardownPolicy {
    /// Extra count queries made while this session's own PTY may still be
    /// registered in the pod.
    pub settle_attempts: u32,
    pub settle_interval: Duration,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            settle_attempts: 3,
            settle_interval: Duration::from_millis(500),
        }
    }
}

/// Deletion rule: delete iff shutting down or nobody else is attached.
pub fn should_delete(shutting_down: bool, count: usize) -> bool {
    shutting_down || count == IDLE_PTY_COUNT
}

/// Parse the output of [`COUNT_PTYS_COMMAND`].
pub fn parse_pty_count(output: &str) -> Result<usize, ClusterError> {
    output
        .trim()
        .parse()
        .map_err(|_| ClusterError::UnexpectedOutput(output.to_string()))
}

/// Count the PTYs currently allocated inside `pod`.
pub async fn count_ptys(cluster: &dyn ClusterApi, pod: &Pod) -> Result<usize, ClusterError> {
    let output = cluster.exec_in_pod(pod, &COUNT_PTYS_COMMAND).await?;
    parse_pty_count(&output)
}

/// Decide whether `pod` goes away and delete it if so.
///
/// `shutting_down` is a snapshot taken by the caller. `settle` is set when
/// this session held an attach a moment ago: its PTY can take a short while
/// to be released, so a count above one is re-read a few times before
/// deciding. Deletion and the shutdown notice are best-effort; only a failed
/// count query is returned as an error.
pub async fn evaluate(
    cluster: &dyn ClusterApi,
    pod: &Pod,
    shutting_down: bool,
    settle: bool,
    policy: TeardownPolicy,
) -> Result<Decision, ClusterError> {
    let name = pod_name(pod);

    if shutting_down {
        if let Err(e) = cluster.exec_in_pod(pod, &SHUTDOWN_NOTICE_COMMAND).await {
            tracing::warn!(pod = %name, error = %e, "failed to broadcast shutdown notice");
        }
        delete_best_effort(cluster, pod).await;
        return Ok(Decision::Deleted { forced: true });
    }

    let mut count = count_ptys(cluster, pod).await?;
    if settle {
        let mut attempt = 0;
        while count > IDLE_PTY_COUNT && attempt < policy.settle_attempts {
            tokio::time::sleep(policy.settle_interval).await;
            count = count_ptys(cluster, pod).await?;
            attempt += 1;
        }
    }
    tracing::debug!(pod = %name, count, "active ptys");

    if should_delete(false, count) {
        tracing::info!(pod = %name, "last terminal left, deleting pod");
        delete_best_effort(cluster, pod).await;
        Ok(Decision::Deleted { forced: false })
    } else {
        Ok(Decision::Kept { count })
    }
}

async fn delete_best_effort(cluster: &dyn ClusterApi, pod: &Pod) {
    if let Err(e) = cluster.delete_pod(pod).await {
        tracing::warn!(pod = %pod_name(pod), error = %e, "failed to delete pod");
    }
}
