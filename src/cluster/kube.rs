//! [`ClusterApi`] backed by the Kubernetes API through `kube`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{
    Api, AttachParams, DeleteParams, LogParams, PostParams, TerminalSize as KubeTerminalSize,
    WatchEvent, WatchParams,
};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::logs::next_line;
use super::pod_spec::PodTemplate;
use super::{
    pod_name, primary_container, volume_name, AttachIo, ClusterApi, ClusterError, PodReadiness,
    LOG_TAIL_SEED_LINES,
};

const ATTACH_READ_BUFFER: usize = 4096;

/// Kubernetes client scoped to one namespace.
///
/// Cheap to clone; the underlying `kube::Client` shares its connection pool.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    template: PodTemplate,
}

impl KubeCluster {
    pub fn new(client: Client, template: PodTemplate) -> Self {
        Self {
            namespace: template.namespace.clone(),
            client,
            template,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn volumes(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a create failure, turning HTTP 409 into [`ClusterError::AlreadyExists`].
fn create_error(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => ClusterError::Api(other),
    }
}

fn single_object(name: &str) -> WatchParams {
    WatchParams::default().fields(&format!("metadata.name={name}"))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolumeClaim>, ClusterError> {
        self.volumes().get_opt(name).await.map_err(ClusterError::Api)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        self.pods().get_opt(name).await.map_err(ClusterError::Api)
    }

    async fn create_volume(
        &self,
        name: &str,
        size: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let pvc = self.template.volume(name, size);
        let created = self
            .volumes()
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| create_error("volume", name, e))?;
        tracing::info!(volume = %name, namespace = %self.namespace, "created volume");
        Ok(created)
    }

    async fn create_pod(
        &self,
        name: &str,
        image: &str,
        volume: &PersistentVolumeClaim,
        first_boot: bool,
    ) -> Result<Pod, ClusterError> {
        let pod = self.template.pod(name, image, volume_name(volume), first_boot);
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| create_error("pod", name, e))?;
        tracing::info!(pod = %name, first_boot, "created pod");
        Ok(created)
    }

    async fn wait_for_volume_ready(
        &self,
        volume: &PersistentVolumeClaim,
    ) -> Result<(), ClusterError> {
        let name = volume_name(volume);
        let volumes = self.volumes();
        // A watch from version "0" replays the current object as Added, so a
        // volume that is already present resolves immediately.
        loop {
            let mut events = volumes
                .watch(&single_object(name), "0")
                .await
                .map_err(ClusterError::Api)?
                .boxed();

            while let Some(event) = events.try_next().await.map_err(ClusterError::Api)? {
                match event {
                    WatchEvent::Added(_) | WatchEvent::Modified(_) => return Ok(()),
                    WatchEvent::Deleted(_) => {
                        return Err(ClusterError::Stream(format!("volume {name} was deleted")))
                    }
                    WatchEvent::Bookmark(_) => {}
                    WatchEvent::Error(e) => return Err(ClusterError::Stream(e.message)),
                }
            }
            tracing::debug!(volume = %name, "volume watch closed, reopening");
        }
    }

    async fn wait_for_pod_phase(
        &self,
        pod: &Pod,
        init_logged: bool,
    ) -> Result<PodReadiness, ClusterError> {
        let name = pod_name(pod);
        let pods = self.pods();
        loop {
            let mut events = pods
                .watch(&single_object(name), "0")
                .await
                .map_err(ClusterError::Api)?
                .boxed();

            while let Some(event) = events.try_next().await.map_err(ClusterError::Api)? {
                match event {
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                        match PodReadiness::observe(&pod)?.after_init_logged(init_logged) {
                            PodReadiness::Unknown => continue,
                            decided => return Ok(decided),
                        }
                    }
                    WatchEvent::Deleted(_) => {
                        return Err(ClusterError::PodDeleted {
                            name: name.to_string(),
                        })
                    }
                    WatchEvent::Bookmark(_) => {}
                    WatchEvent::Error(e) => return Err(ClusterError::Stream(e.message)),
                }
            }
            tracing::debug!(pod = %name, "pod watch closed, reopening");
        }
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let name = pod_name(pod);
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(pod = %name, "deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                tracing::debug!(pod = %name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(ClusterError::Api(e)),
        }
    }

    async fn tail_logs(
        &self,
        pod: &Pod,
        container: &str,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<(), ClusterError> {
        let name = pod_name(pod);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            tail_lines: Some(LOG_TAIL_SEED_LINES),
            ..Default::default()
        };
        let reader = self
            .pods()
            .log_stream(name, &params)
            .await
            .map_err(ClusterError::Api)?;

        tracing::debug!(pod = %name, container, "tailing logs");
        let mut reader = Box::pin(reader);
        let mut buf = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut buf).await? {
            tracing::debug!(pod = %name, line = %line, "log line");
            if sink.send(line).is_err() {
                break;
            }
        }
        tracing::debug!(pod = %name, container, "log tail ended");
        Ok(())
    }

    async fn exec_in_pod(&self, pod: &Pod, command: &[&str]) -> Result<String, ClusterError> {
        let container = primary_container(pod)?;
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false)
            .tty(false);
        let mut process = self
            .pods()
            .exec(pod_name(pod), command.iter().copied(), &params)
            .await
            .map_err(ClusterError::Api)?;

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout.read_to_string(&mut output).await?;
        }
        process
            .join()
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))?;
        Ok(output)
    }

    async fn attach(&self, pod: &Pod, username: &str, io: AttachIo) -> Result<(), ClusterError> {
        let name = pod_name(pod);
        let params = AttachParams::interactive_tty().container(primary_container(pod)?);
        let mut process = self
            .pods()
            .exec(name, ["su", "-", username], &params)
            .await
            .map_err(ClusterError::Api)?;

        let missing = |what: &str| ClusterError::Stream(format!("attach stream has no {what}"));
        let mut stdin = process.stdin().ok_or_else(|| missing("stdin"))?;
        let mut stdout = process.stdout().ok_or_else(|| missing("stdout"))?;
        let mut size_tx = process.terminal_size().ok_or_else(|| missing("terminal size"))?;
        tracing::info!(pod = %name, user = %username, "attached");

        let AttachIo {
            mut input,
            output,
            mut resize,
        } = io;

        let input_pump = async move {
            while let Some(chunk) = input.recv().await {
                stdin.write_all(&chunk).await?;
                stdin.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let output_pump = async move {
            let mut buf = vec![0u8; ATTACH_READ_BUFFER];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if output
                    .send(bytes::Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        };

        let resize_pump = async move {
            while let Some(size) = resize.next().await {
                let size = KubeTerminalSize {
                    width: size.width,
                    height: size.height,
                };
                if size_tx.send(size).await.is_err() {
                    break;
                }
            }
        };

        let shell_exited = tokio::select! {
            r = output_pump => { r?; true }
            r = input_pump => { r?; false }
            _ = resize_pump => false,
        };

        if shell_exited {
            process
                .join()
                .await
                .map_err(|e| ClusterError::Stream(e.to_string()))?;
        }
        tracing::info!(pod = %name, user = %username, "detached");
        Ok(())
    }
}
