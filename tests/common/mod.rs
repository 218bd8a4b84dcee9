#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use boombox::cluster::{
    pod_name, AttachIo, ClusterApi, ClusterError, PodReadiness, COUNT_PTYS_COMMAND,
    SHUTDOWN_NOTICE_COMMAND,
};
use boombox::session::{Connection, Session, SessionEvent, SessionReport, SessionSettings};
use boombox::shutdown::{ShutdownCoordinator, ShutdownSignal};
use boombox::state::State;
use boombox::terminal::TerminalSize;

/// Upper bound on any single wait in these tests. Time is usually paused, so
/// this only trips when a session is genuinely stuck.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Cluster operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetPod,
    GetVolume,
    CreateVolume,
    CreatePod,
    WaitVolume,
    WaitPod,
    TailLogs,
    Exec,
    Delete,
    Attach,
}

/// A scripted failure, consumed by the next call of its [`Op`].
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail with a stream error carrying this message. For [`Op::Attach`]
    /// the shell runs normally and the stream fails when it exits.
    Error(String),
    /// Someone else created the object first: it appears, then the create
    /// reports a conflict.
    Conflict,
    /// Never complete.
    Hang,
    /// Succeed after this long.
    Delay(Duration),
}

/// One observation returned by `wait_for_pod_phase`.
#[derive(Debug, Clone)]
pub enum PodStep {
    InitRunning,
    Ready,
    Failed(String),
    Deleted,
}

#[derive(Default)]
struct Inner {
    pods: HashMap<String, Pod>,
    volumes: HashMap<String, PersistentVolumeClaim>,
    pod_steps: VecDeque<PodStep>,
    init_logs: Vec<String>,
    attached: HashMap<String, usize>,
    release_lag: Duration,
    faults: HashMap<Op, VecDeque<Fault>>,
    calls: Vec<String>,
    deleted: Vec<String>,
    notices: Vec<String>,
    counts: Vec<usize>,
    resizes: Vec<TerminalSize>,
    typed: Vec<u8>,
}

/// In-memory cluster. Each pod has one console PTY for its whole life plus
/// one PTY per attached shell.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a running, ready pod and its volume, as if from an earlier login.
    pub fn with_running_pod(self: Arc<Self>, name: &str) -> Arc<Self> {
        {
            let mut inner = self.inner.lock();
            inner.volumes.insert(name.to_string(), volume(name));
            inner.pods.insert(name.to_string(), running_pod(name));
        }
        self
    }

    /// Make a running pod appear, as if another session created it.
    pub fn insert_running_pod(&self, name: &str) {
        self.inner
            .lock()
            .pods
            .insert(name.to_string(), running_pod(name));
    }

    pub fn with_volume(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.inner
            .lock()
            .volumes
            .insert(name.to_string(), volume(name));
        self
    }

    /// Seed a pod that already ran to completion in `phase`.
    pub fn with_finished_pod(self: Arc<Self>, name: &str, phase: &str) -> Arc<Self> {
        let mut pod = running_pod(name);
        if let Some(status) = pod.status.as_mut() {
            status.phase = Some(phase.to_string());
            status.conditions = None;
        }
        self.inner.lock().pods.insert(name.to_string(), pod);
        self
    }

    /// Observations returned by successive pod waits. Once exhausted, waits
    /// report the pod ready.
    pub fn script_pod(&self, steps: impl IntoIterator<Item = PodStep>) {
        self.inner.lock().pod_steps.extend(steps);
    }

    pub fn set_init_logs(&self, lines: &[&str]) {
        self.inner.lock().init_logs = lines.iter().map(|l| l.to_string()).collect();
    }

    /// Delay between an attach ending and its PTY disappearing from counts.
    pub fn set_release_lag(&self, lag: Duration) {
        self.inner.lock().release_lag = lag;
    }

    pub fn fail(&self, op: Op, fault: Fault) {
        self.inner
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().deleted.clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.inner.lock().notices.clone()
    }

    /// Every PTY count reported, in order.
    pub fn counts(&self) -> Vec<usize> {
        self.inner.lock().counts.clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.inner.lock().resizes.clone()
    }

    pub fn typed(&self) -> Vec<u8> {
        self.inner.lock().typed.clone()
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.inner.lock().pods.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.inner.lock().volumes.contains_key(name)
    }

    pub fn attached(&self, name: &str) -> usize {
        self.inner.lock().attached.get(name).copied().unwrap_or(0)
    }

    pub fn pty_count(&self, name: &str) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .pods
            .contains_key(name)
            .then(|| 1 + inner.attached.get(name).copied().unwrap_or(0))
    }

    fn record(&self, call: String) {
        self.inner.lock().calls.push(call);
    }

    fn take_fault(&self, op: Op) -> Option<Fault> {
        self.inner.lock().faults.get_mut(&op)?.pop_front()
    }

    /// Apply a scripted error or hang. Conflicts are left to the caller.
    async fn check(&self, op: Op) -> Result<Option<Fault>, ClusterError> {
        match self.take_fault(op) {
            Some(Fault::Error(message)) => Err(ClusterError::Stream(message)),
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Delay(after)) => {
                tokio::time::sleep(after).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn lookup_pod(&self, name: &str) -> Result<(), ClusterError> {
        if self.has_pod(name) {
            Ok(())
        } else {
            Err(ClusterError::Stream(format!("pods \"{name}\" not found")))
        }
    }
}

/// Holds one attach PTY open; releases it after the configured lag.
struct PtySlot {
    inner: Arc<Mutex<Inner>>,
    pod: String,
}

impl PtySlot {
    fn open(inner: &Arc<Mutex<Inner>>, pod: &str) -> Self {
        *inner.lock().attached.entry(pod.to_string()).or_default() += 1;
        Self {
            inner: Arc::clone(inner),
            pod: pod.to_string(),
        }
    }
}

impl Drop for PtySlot {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        let pod = std::mem::take(&mut self.pod);
        let release = move || {
            if let Some(n) = inner.lock().attached.get_mut(&pod) {
                *n = n.saturating_sub(1);
            }
        };
        let lag = self.inner.lock().release_lag;
        if lag.is_zero() {
            release();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(lag).await;
                release();
            });
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, ClusterError> {
        self.record(format!("get_volume {name}"));
        self.check(Op::GetVolume).await?;
        Ok(self.inner.lock().volumes.get(name).cloned())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.record(format!("get_pod {name}"));
        self.check(Op::GetPod).await?;
        Ok(self.inner.lock().pods.get(name).cloned())
    }

    async fn create_volume(
        &self,
        name: &str,
        size: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        self.record(format!("create_volume {name} {size}"));
        let fault = self.check(Op::CreateVolume).await?;
        let mut inner = self.inner.lock();
        if matches!(fault, Some(Fault::Conflict)) {
            inner.volumes.insert(name.to_string(), volume(name));
        }
        if inner.volumes.contains_key(name) {
            return Err(ClusterError::AlreadyExists {
                kind: "PersistentVolumeClaim",
                name: name.to_string(),
            });
        }
        let created = volume(name);
        inner.volumes.insert(name.to_string(), created.clone());
        Ok(created)
    }

    async fn create_pod(
        &self,
        name: &str,
        image: &str,
        _volume: &PersistentVolumeClaim,
        first_boot: bool,
    ) -> Result<Pod, ClusterError> {
        self.record(format!("create_pod {name} {image} first_boot={first_boot}"));
        let fault = self.check(Op::CreatePod).await?;
        let mut inner = self.inner.lock();
        if matches!(fault, Some(Fault::Conflict)) {
            inner.pods.insert(name.to_string(), running_pod(name));
        }
        if inner.pods.contains_key(name) {
            return Err(ClusterError::AlreadyExists {
                kind: "Pod",
                name: name.to_string(),
            });
        }
        let created = pending_pod(name);
        inner.pods.insert(name.to_string(), created.clone());
        Ok(created)
    }

    async fn wait_for_volume_ready(
        &self,
        volume: &PersistentVolumeClaim,
    ) -> Result<(), ClusterError> {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.record(format!("wait_for_volume_ready {name}"));
        self.check(Op::WaitVolume).await?;
        Ok(())
    }

    async fn wait_for_pod_phase(
        &self,
        pod: &Pod,
        init_logged: bool,
    ) -> Result<PodReadiness, ClusterError> {
        let name = pod_name(pod).to_string();
        self.record(format!("wait_for_pod_phase {name}"));
        self.check(Op::WaitPod).await?;
        // Give the session loop a chance to interleave, like a real watch.
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock();
        // Like a watch replaying a stale status, skip what no longer decides.
        let step = loop {
            match inner.pod_steps.pop_front().unwrap_or(PodStep::Ready) {
                PodStep::InitRunning if init_logged => continue,
                step => break step,
            }
        };
        match step {
            PodStep::InitRunning => Ok(PodReadiness::InitContainerRunning),
            PodStep::Ready => {
                inner.pods.insert(name.clone(), running_pod(&name));
                Ok(PodReadiness::Ready)
            }
            PodStep::Failed(reason) => Err(ClusterError::PodFailed { reason }),
            PodStep::Deleted => {
                inner.pods.remove(&name);
                Err(ClusterError::PodDeleted { name })
            }
        }
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let name = pod_name(pod).to_string();
        self.record(format!("delete_pod {name}"));
        self.check(Op::Delete).await?;
        let mut inner = self.inner.lock();
        inner.pods.remove(&name);
        inner.deleted.push(name);
        Ok(())
    }

    async fn tail_logs(
        &self,
        pod: &Pod,
        container: &str,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), ClusterError> {
        self.record(format!("tail_logs {} {container}", pod_name(pod)));
        self.check(Op::TailLogs).await?;
        let lines = self.inner.lock().init_logs.clone();
        for line in lines {
            if sink.send(line).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn exec_in_pod(&self, pod: &Pod, command: &[&str]) -> Result<String, ClusterError> {
        let name = pod_name(pod).to_string();
        self.check(Op::Exec).await?;
        self.lookup_pod(&name)?;

        if command == COUNT_PTYS_COMMAND.as_slice() {
            self.record(format!("count_ptys {name}"));
            let count = self.pty_count(&name).unwrap_or(0);
            self.inner.lock().counts.push(count);
            Ok(format!("{count}\n"))
        } else if command == SHUTDOWN_NOTICE_COMMAND.as_slice() {
            self.record(format!("shutdown_notice {name}"));
            self.inner.lock().notices.push(name);
            Ok(String::new())
        } else {
            self.record(format!("exec {name} {}", command.join(" ")));
            Ok(String::new())
        }
    }

    async fn attach(&self, pod: &Pod, username: &str, io: AttachIo) -> Result<(), ClusterError> {
        let name = pod_name(pod).to_string();
        self.record(format!("attach {name} {username}"));
        let fault = self.take_fault(Op::Attach);
        self.lookup_pod(&name)?;

        let _slot = PtySlot::open(&self.inner, &name);
        let AttachIo {
            mut input,
            output,
            mut resize,
        } = io;
        let _ = output.send(Bytes::from(format!("{username}@{name}:~$ "))).await;

        let mut resize_open = true;
        loop {
            tokio::select! {
                chunk = input.recv() => match chunk {
                    Some(bytes) => {
                        self.inner.lock().typed.extend_from_slice(&bytes);
                        if bytes.windows(4).any(|w| w == b"exit") {
                            break;
                        }
                        let _ = output.send(bytes).await;
                    }
                    None => break,
                },
                size = resize.next(), if resize_open => match size {
                    Some(size) => self.inner.lock().resizes.push(size),
                    None => resize_open = false,
                },
            }
        }

        match fault {
            Some(Fault::Error(message)) => Err(ClusterError::Stream(message)),
            _ => Ok(()),
        }
    }
}

pub fn volume(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod_with(name: &str, status: PodStatus) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "shell".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(status),
    }
}

pub fn pending_pod(name: &str) -> Pod {
    pod_with(
        name,
        PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        },
    )
}

pub fn running_pod(name: &str) -> Pod {
    pod_with(
        name,
        PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
    )
}

/// Settings with a short exit grace so finished sessions close quickly.
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        image: "devbox".to_string(),
        volume_size: "1Gi".to_string(),
        exit_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

/// A running session plus the client side of its connection.
pub struct TestClient {
    pub input: mpsc::UnboundedSender<Bytes>,
    pub resize: watch::Sender<TerminalSize>,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<SessionReport>,
    screen: Arc<Mutex<Vec<u8>>>,
    seen: Vec<SessionEvent>,
}

/// Start a session for `username` against `cluster`.
pub fn connect(
    cluster: Arc<FakeCluster>,
    settings: SessionSettings,
    shutdown: ShutdownSignal,
    username: &str,
) -> TestClient {
    connect_with(cluster, settings, shutdown, username, CancellationToken::new())
}

/// Like [`connect`], with the connection cancelled through `cancel`.
pub fn connect_with(
    cluster: Arc<FakeCluster>,
    settings: SessionSettings,
    shutdown: ShutdownSignal,
    username: &str,
    cancel: CancellationToken,
) -> TestClient {
    start(cluster, settings, shutdown, username, cancel, |session| {
        tokio::spawn(session.run())
    })
}

/// Start a session the way the SSH front end does: counted in the
/// coordinator's registry, cancelled with its transport, and spawned on its
/// task tracker.
pub fn connect_tracked(
    cluster: Arc<FakeCluster>,
    settings: SessionSettings,
    coordinator: &ShutdownCoordinator,
    username: &str,
) -> TestClient {
    let guard = coordinator.registry().register();
    let tasks = coordinator.tracker();
    start(
        cluster,
        settings,
        coordinator.signal(),
        username,
        coordinator.transport_token().child_token(),
        move |session| {
            tasks.spawn(async move {
                let _guard = guard;
                session.run().await
            })
        },
    )
}

fn start(
    cluster: Arc<FakeCluster>,
    settings: SessionSettings,
    shutdown: ShutdownSignal,
    username: &str,
    cancel: CancellationToken,
    spawn: impl FnOnce(Session) -> JoinHandle<SessionReport>,
) -> TestClient {
    let size = TerminalSize::new(120, 40);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(64);
    let (resize_tx, resize_rx) = watch::channel(size);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session = Session::new(
        cluster,
        Arc::new(settings),
        shutdown,
        Connection {
            username: username.to_string(),
            size,
            input: input_rx,
            output: output_tx,
            resize: resize_rx,
            cancel: cancel.clone(),
        },
    )
    .with_events(events_tx);

    let screen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&screen);
    tokio::spawn(async move {
        while let Some(bytes) = output_rx.recv().await {
            sink.lock().extend_from_slice(&bytes);
        }
    });

    TestClient {
        input: input_tx,
        resize: resize_tx,
        cancel,
        events: events_rx,
        task: spawn(session),
        screen,
        seen: Vec::new(),
    }
}

impl TestClient {
    pub fn type_bytes(&self, bytes: &[u8]) {
        self.input
            .send(Bytes::copy_from_slice(bytes))
            .expect("session input closed");
    }

    pub fn screen(&self) -> String {
        String::from_utf8_lossy(&self.screen.lock()).into_owned()
    }

    /// Wait until the session enters `state`, returning its event.
    pub async fn wait_for_state(&mut self, state: State) -> SessionEvent {
        self.wait_for(|e| matches!(e, SessionEvent::StateChanged { state: s, .. } if *s == state))
            .await
    }

    /// Wait for the next teardown event.
    pub async fn wait_for_teardown(&mut self) -> SessionEvent {
        self.wait_for(|e| matches!(e, SessionEvent::Teardown { .. }))
            .await
    }

    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("session ended early");
                self.seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Wait for the session to end and collect any remaining events.
    pub async fn finish(mut self) -> (SessionReport, Vec<SessionEvent>) {
        let report = tokio::time::timeout(STEP_TIMEOUT, &mut self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked");
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        (report, self.seen)
    }
}

/// Poll `cond` until it holds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(STEP_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "never observed: {what}");
}

/// States visited, in order.
pub fn states(events: &[SessionEvent]) -> Vec<State> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

pub fn teardowns(events: &[SessionEvent]) -> Vec<&SessionEvent> {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Teardown { .. }))
        .collect()
}
