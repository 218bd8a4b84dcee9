//! Per-connection session actor.
//!
//! A [`Session`] owns everything about one connection: its state, the cluster
//! objects it has discovered, the single in-flight cluster operation, and the
//! terminal it renders to. Its run loop is the only place that reacts to
//! operation results, keystrokes, resizes, and cancellation, so teardown is
//! evaluated at most once per session regardless of how it ends.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    pod_name, terminal_phase, volume_name, AttachIo, ClusterApi, ClusterError, INIT_CONTAINER,
};
use crate::render::Renderer;
use crate::shutdown::ShutdownSignal;
use crate::state::{next_state, Outcome, State, StreamEnd, WatchResult};
use crate::teardown::{self, Decision, TeardownPolicy, Trigger};
use crate::terminal::{ResizeQueue, TerminalSize};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

/// Validate a username. Usernames name the user's pod and volume, so they
/// must be DNS-1123 labels: 1-63 chars of `[a-z0-9-]`, alphanumeric at both
/// ends.
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("username must not be empty".into());
    }
    if name.len() > 63 {
        return Err(format!("username too long ({} chars, max 63)", name.len()));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(format!(
            "username may only contain lowercase letters, digits and '-': {name}"
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("username must start and end with a letter or digit: {name}"));
    }
    Ok(())
}

/// Per-process settings every session reads.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Image tag of the user container.
    pub image: String,
    /// Size of newly created home volumes, e.g. `10Gi`.
    pub volume_size: String,
    /// Bound on every readiness wait and on the init-container log tail.
    pub wait_timeout: Duration,
    /// How long the completion view stays up before the connection closes.
    pub exit_grace: Duration,
    /// Bound on one whole teardown evaluation.
    pub teardown_timeout: Duration,
    pub teardown: TeardownPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            image: "ubuntu".to_string(),
            volume_size: "10Gi".to_string(),
            wait_timeout: Duration::from_secs(900),
            exit_grace: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(30),
            teardown: TeardownPolicy::default(),
        }
    }
}

/// The connection side of a session, supplied by the SSH front end.
pub struct Connection {
    pub username: String,
    pub size: TerminalSize,
    /// Bytes typed by the user. `None` means the client went away.
    pub input: mpsc::UnboundedReceiver<Bytes>,
    /// Bytes for the user's terminal.
    pub output: mpsc::Sender<Bytes>,
    /// Latest window size reported by the client.
    pub resize: watch::Receiver<TerminalSize>,
    /// Cancelled when the connection closes or the transport shuts down.
    pub cancel: CancellationToken,
}

/// Notifications for an observer of the session, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: State,
        volume: Option<String>,
        pod: Option<String>,
        error: Option<String>,
    },
    LogLine(String),
    Teardown {
        trigger: Trigger,
        decision: Result<Decision, String>,
    },
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub final_state: State,
    pub error: Option<String>,
    pub teardown: Option<Decision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Session {
    cluster: Arc<dyn ClusterApi>,
    settings: Arc<SessionSettings>,
    shutdown: ShutdownSignal,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,

    username: String,
    valid_username: bool,
    size: TerminalSize,
    state: State,
    volume: Option<PersistentVolumeClaim>,
    pod: Option<Pod>,
    last_error: Option<ClusterError>,
    created_volume: bool,

    input: mpsc::UnboundedReceiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    resize: watch::Receiver<TerminalSize>,
    resize_open: bool,
    cancel: CancellationToken,

    pending: Option<BoxFuture<'static, Outcome>>,
    log_lines: Option<mpsc::UnboundedReceiver<String>>,
    init_logged: bool,
    resize_queue: ResizeQueue,
    attach_input: Option<mpsc::UnboundedSender<Bytes>>,
    exit_at: Option<Instant>,
    torn_down: bool,
    teardown_decision: Option<Decision>,
    renderer: Renderer,
}

impl Session {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        settings: Arc<SessionSettings>,
        shutdown: ShutdownSignal,
        connection: Connection,
    ) -> Self {
        let Connection {
            username,
            size,
            input,
            output,
            resize,
            cancel,
        } = connection;

        Self {
            cluster,
            settings,
            shutdown,
            events: None,
            valid_username: validate_username(&username).is_ok(),
            username,
            size,
            state: State::Unknown,
            volume: None,
            pod: None,
            last_error: None,
            created_volume: false,
            input,
            output,
            resize,
            resize_open: true,
            cancel,
            pending: None,
            log_lines: None,
            init_logged: false,
            resize_queue: ResizeQueue::new(size),
            attach_input: None,
            exit_at: None,
            torn_down: false,
            teardown_decision: None,
            renderer: Renderer::new(),
        }
    }

    /// Report state changes, log lines, and teardown results to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drive the session until the user leaves, the grace period runs out,
    /// or the connection is cancelled.
    pub async fn run(mut self) -> SessionReport {
        tracing::info!(user = %self.username, width = self.size.width, height = self.size.height, "session started");
        let banner = self.renderer.banner(&self.username);
        self.write(banner).await;

        if let Err(reason) = validate_username(&self.username) {
            self.last_error = Some(ClusterError::InvalidUsername(reason));
            self.transition(State::Error).await;
        } else {
            self.transition(State::FetchingPod).await;
        }

        loop {
            let exit_at = self.exit_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::debug!(user = %self.username, state = %self.state, "connection cancelled");
                    break;
                }

                Some(line) = recv_line(&mut self.log_lines) => {
                    self.on_log_line(line).await;
                }

                outcome = poll_pending(&mut self.pending) => {
                    self.on_outcome(outcome).await;
                }

                chunk = self.input.recv() => match chunk {
                    Some(bytes) => {
                        if self.on_input(bytes) == Flow::Quit {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(user = %self.username, "client input closed");
                        break;
                    }
                },

                changed = self.resize.changed(), if self.resize_open => {
                    if changed.is_ok() {
                        let size = *self.resize.borrow_and_update();
                        self.on_resize(size);
                    } else {
                        self.resize_open = false;
                    }
                }

                _ = tokio::time::sleep_until(exit_at), if self.exit_at.is_some() => {
                    let bye = self.renderer.farewell();
                    self.write(bye).await;
                    break;
                }
            }
        }

        self.finish().await
    }

    async fn finish(mut self) -> SessionReport {
        // Dropping the operation releases an open attach before the PTY count
        // is taken.
        let was_attached = self.pending.is_some() && self.state == State::PodRunning;
        self.pending = None;
        self.attach_input = None;
        self.log_lines = None;

        if let Some(Err(e)) = self.teardown(Trigger::Disconnected, was_attached).await {
            tracing::warn!(user = %self.username, error = %e, "teardown on disconnect failed");
        }

        tracing::info!(user = %self.username, state = %self.state, "session ended");
        SessionReport {
            final_state: self.state,
            error: self.last_error.as_ref().map(ToString::to_string),
            teardown: self.teardown_decision,
        }
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        if let Outcome::StreamEnded(StreamEnd::Attach(result)) = outcome {
            self.on_attach_end(result).await;
            return;
        }

        let finished = match (self.state, &outcome) {
            (State::FetchingPod, Outcome::PodFetched(Some(pod))) => {
                terminal_phase(pod).map(|phase| (pod.clone(), phase.to_string()))
            }
            _ => None,
        };
        if let Some((pod, phase)) = finished {
            self.discard_finished_pod(&pod).await;
            self.last_error = Some(ClusterError::PodTerminated {
                name: pod_name(&pod).to_string(),
                phase,
            });
            self.transition(State::Error).await;
            return;
        }

        let next = next_state(self.state, &outcome);
        match outcome {
            Outcome::PodFetched(Some(pod)) | Outcome::PodCreated(pod) => self.pod = Some(pod),
            Outcome::VolumeFetched(Some(volume)) | Outcome::VolumeCreated(volume) => {
                self.volume = Some(volume)
            }
            Outcome::Failed(e) if next != State::Error => {
                tracing::info!(user = %self.username, state = %self.state, error = %e, "created concurrently, fetching again");
                if self.state == State::CreatingPvc {
                    self.created_volume = false;
                }
            }
            Outcome::Failed(e) => self.last_error = Some(e),
            other if next == State::Error => {
                self.last_error = Some(ClusterError::UnexpectedOutcome(format!(
                    "{} ({other:?})",
                    self.state
                )));
            }
            _ => {}
        }
        self.transition(next).await;
    }

    async fn on_attach_end(&mut self, result: Result<(), ClusterError>) {
        self.attach_input = None;
        if let Err(e) = &result {
            tracing::warn!(user = %self.username, error = %e, "attach stream failed");
        }

        let teardown = self.teardown(Trigger::AttachEnded, true).await;
        let outcome = Outcome::StreamEnded(StreamEnd::Attach(result));
        let mut next = next_state(self.state, &outcome);
        if let Outcome::StreamEnded(StreamEnd::Attach(Err(e))) = outcome {
            self.last_error = Some(e);
        } else if let Some(Err(e)) = teardown {
            self.last_error = Some(e);
            next = State::Error;
        }
        self.transition(next).await;
    }

    fn on_input(&mut self, bytes: Bytes) -> Flow {
        match self.state {
            State::PodRunning if self.attach_input.is_some() => {
                if let Some(tx) = &self.attach_input {
                    // The attach is ending; its outcome arrives separately.
                    let _ = tx.send(bytes);
                }
                Flow::Continue
            }
            State::Error | State::PodTerminated => Flow::Quit,
            _ if bytes.iter().any(|b| *b == CTRL_C || *b == CTRL_D) => Flow::Quit,
            _ => Flow::Continue,
        }
    }

    fn on_resize(&mut self, size: TerminalSize) {
        self.size = size;
        if self.state == State::PodRunning {
            self.resize_queue.push(size);
        }
    }

    async fn on_log_line(&mut self, line: String) {
        self.emit(SessionEvent::LogLine(line.clone()));
        let frame = self.renderer.log_line(&line);
        self.write(frame).await;
    }

    async fn transition(&mut self, next: State) {
        let prev = self.state;
        self.state = next;
        tracing::debug!(user = %self.username, from = %prev, to = %next, "state transition");

        // The tail can deliver its last lines in the same poll that ends it.
        if let Some(mut lines) = self.log_lines.take() {
            while let Ok(line) = lines.try_recv() {
                self.on_log_line(line).await;
            }
            self.init_logged = true;
        }

        let frame = match next {
            State::Error => {
                let err = self
                    .last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown error".to_string());
                tracing::error!(user = %self.username, error = %err, "session failed");
                self.renderer.error(&err)
            }
            State::PodTerminated => {
                self.exit_at = Some(Instant::now() + self.settings.exit_grace);
                self.renderer.terminated(self.settings.exit_grace)
            }
            _ => self.renderer.state_changed(next, Instant::now()),
        };
        self.write(frame).await;

        self.emit(SessionEvent::StateChanged {
            state: next,
            volume: self.volume.as_ref().map(|v| volume_name(v).to_string()),
            pod: self.pod.as_ref().map(|p| pod_name(p).to_string()),
            error: if next == State::Error {
                self.last_error.as_ref().map(ToString::to_string)
            } else {
                None
            },
        });

        self.pending = self.dispatch();
    }

    /// Start the entry action of the current state.
    fn dispatch(&mut self) -> Option<BoxFuture<'static, Outcome>> {
        let cluster = Arc::clone(&self.cluster);
        let name = self.username.clone();
        let settings = Arc::clone(&self.settings);
        let wait = settings.wait_timeout;

        let fut = match self.state {
            State::FetchingPod => async move {
                complete(cluster.get_pod(&name).await, Outcome::PodFetched)
            }
            .boxed(),

            State::FetchingPvc => async move {
                complete(cluster.get_volume(&name).await, Outcome::VolumeFetched)
            }
            .boxed(),

            State::CreatingPvc => {
                self.created_volume = true;
                async move {
                    complete(
                        cluster.create_volume(&name, &settings.volume_size).await,
                        Outcome::VolumeCreated,
                    )
                }
                .boxed()
            }

            State::WaitingForPvc => {
                let volume = self.volume.clone();
                async move {
                    let result = match volume {
                        Some(volume) => {
                            bounded("waiting for the volume", wait, async {
                                cluster.wait_for_volume_ready(&volume).await
                            })
                            .await
                        }
                        None => Err(ClusterError::NotTracked("volume")),
                    };
                    complete(result, |()| Outcome::WatchEvent(WatchResult::VolumeReady))
                }
                .boxed()
            }

            State::CreatingPod => {
                let volume = self.volume.clone();
                let first_boot = self.created_volume;
                async move {
                    let result = match volume {
                        Some(volume) => {
                            cluster
                                .create_pod(&name, &settings.image, &volume, first_boot)
                                .await
                        }
                        None => Err(ClusterError::NotTracked("volume")),
                    };
                    complete(result, Outcome::PodCreated)
                }
                .boxed()
            }

            State::WaitingForPod => {
                let pod = self.pod.clone();
                let init_logged = self.init_logged;
                async move {
                    let result = match pod {
                        Some(pod) => {
                            bounded("waiting for the pod", wait, async {
                                cluster.wait_for_pod_phase(&pod, init_logged).await
                            })
                            .await
                        }
                        None => Err(ClusterError::NotTracked("pod")),
                    };
                    complete(result, |phase| Outcome::WatchEvent(WatchResult::PodPhase(phase)))
                }
                .boxed()
            }

            State::WaitingForInitContainer => {
                let pod = self.pod.clone();
                let (tx, rx) = mpsc::unbounded_channel();
                self.log_lines = Some(rx);
                async move {
                    let result = match pod {
                        Some(pod) => {
                            bounded("waiting for setup to complete", wait, async {
                                cluster.tail_logs(&pod, INIT_CONTAINER, tx).await
                            })
                            .await
                        }
                        None => Err(ClusterError::NotTracked("pod")),
                    };
                    complete(result, |()| Outcome::StreamEnded(StreamEnd::LogTail))
                }
                .boxed()
            }

            State::PodRunning => {
                let pod = self.pod.clone();
                let (tx, rx) = mpsc::unbounded_channel();
                self.attach_input = Some(tx);
                self.resize_queue.push(self.size);
                let io = AttachIo {
                    input: rx,
                    output: self.output.clone(),
                    resize: self.resize_queue.subscribe(),
                };
                async move {
                    let result = match pod {
                        Some(pod) => cluster.attach(&pod, &name, io).await,
                        None => Err(ClusterError::NotTracked("pod")),
                    };
                    Outcome::StreamEnded(StreamEnd::Attach(result))
                }
                .boxed()
            }

            State::Unknown | State::PodTerminated | State::Error => return None,
        };
        Some(fut)
    }

    /// Evaluate pod teardown once per session.
    ///
    /// The shutdown flag is read here, once. On disconnect the pod is looked
    /// up by name when this session never saw it, since another session or
    /// an in-flight create may own it.
    async fn teardown(
        &mut self,
        trigger: Trigger,
        settle: bool,
    ) -> Option<Result<Decision, ClusterError>> {
        if self.torn_down || !self.valid_username {
            return None;
        }
        self.torn_down = true;
        let shutting_down = self.shutdown.is_set();
        let limit = self.settings.teardown_timeout;
        let policy = self.settings.teardown;
        let cluster = Arc::clone(&self.cluster);

        let pod = match (self.pod.clone(), trigger) {
            (Some(pod), _) => pod,
            (None, Trigger::AttachEnded) => return Some(Err(ClusterError::NotTracked("pod"))),
            (None, Trigger::Disconnected) => {
                let name = self.username.clone();
                let lookup = bounded("looking up the pod", limit, async {
                    cluster.get_pod(&name).await
                })
                .await;
                match lookup {
                    Ok(Some(pod)) => pod,
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
        };

        let result = bounded("evaluating teardown", limit, async {
            teardown::evaluate(cluster.as_ref(), &pod, shutting_down, settle, policy).await
        })
        .await;

        match &result {
            Ok(decision) => {
                tracing::debug!(user = %self.username, pod = %pod_name(&pod), ?trigger, ?decision, shutting_down, "teardown evaluated");
                self.teardown_decision = Some(*decision);
            }
            Err(e) => {
                tracing::warn!(user = %self.username, pod = %pod_name(&pod), ?trigger, error = %e, "teardown evaluation failed");
            }
        }
        self.emit(SessionEvent::Teardown {
            trigger,
            decision: result.as_ref().map(|d| *d).map_err(ToString::to_string),
        });
        Some(result)
    }

    /// Remove a pod that already ran to completion so the next connection
    /// starts fresh.
    async fn discard_finished_pod(&mut self, pod: &Pod) {
        let limit = self.settings.teardown_timeout;
        let cluster = Arc::clone(&self.cluster);
        let result = bounded("deleting a finished pod", limit, async {
            cluster.delete_pod(pod).await
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(pod = %pod_name(pod), error = %e, "failed to delete finished pod");
        }
    }

    async fn write(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let output = self.output.clone();
        // A closed output means the client is gone; cancellation follows.
        let _ = output.send(Bytes::from(bytes)).await;
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn complete<T>(result: Result<T, ClusterError>, ok: impl FnOnce(T) -> Outcome) -> Outcome {
    match result {
        Ok(value) => ok(value),
        Err(e) => Outcome::Failed(e),
    }
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, ClusterError>>,
) -> Result<T, ClusterError> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ClusterError::Timeout { operation, after })?
}

async fn poll_pending(pending: &mut Option<BoxFuture<'static, Outcome>>) -> Outcome {
    let Some(fut) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let outcome = fut.await;
    *pending = None;
    outcome
}

async fn recv_line(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
