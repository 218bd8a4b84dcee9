//! SSH front end.
//!
//! Accepts TCP connections, runs the SSH handshake with `russh`, and turns
//! each interactive shell request into a [`Session`]. The SSH user name is
//! the identity; authentication is left to the network boundary in front of
//! the gateway, so both `none` and public-key logins are accepted.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use russh::server::{Auth, Config, Handler, Msg, Session as SshSession};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cluster::ClusterApi;
use crate::registry::SessionRegistry;
use crate::session::{Connection, Session, SessionSettings};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::state::State;
use crate::terminal::TerminalSize;

const OUTPUT_BUFFER: usize = 64;
const NO_TERMINAL_MESSAGE: &[u8] = b"No active terminal\r\n";

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to load host key from {path}: {source}")]
    HostKey {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a connection needs to start a session.
#[derive(Clone)]
pub struct Gateway {
    pub cluster: Arc<dyn ClusterApi>,
    pub settings: Arc<SessionSettings>,
    pub shutdown: ShutdownSignal,
    pub registry: SessionRegistry,
    /// Connection and session tasks are spawned here so exit can wait for
    /// their teardown.
    pub tasks: TaskTracker,
}

/// Build the SSH server configuration around the host key at `host_key_path`.
pub fn server_config(host_key_path: &Path) -> Result<Arc<Config>, ServeError> {
    let key = russh_keys::load_secret_key(host_key_path, None).map_err(|source| {
        ServeError::HostKey {
            path: host_key_path.to_path_buf(),
            source,
        }
    })?;
    Ok(Arc::new(Config {
        keys: vec![key],
        methods: MethodSet::NONE | MethodSet::PUBLICKEY,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    }))
}

/// Accept SSH connections until the coordinator's accept token is cancelled.
///
/// Connections already running keep going; each is closed when its client
/// leaves or when the coordinator closes the transport.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    gateway: Gateway,
    shutdown: &ShutdownCoordinator,
) -> Result<(), ServeError> {
    let accept = shutdown.accept_token();
    let transport = shutdown.transport_token();
    tracing::info!(addr = %listener.local_addr()?, "ssh server listening");

    loop {
        tokio::select! {
            _ = accept.cancelled() => {
                tracing::debug!("accept loop stopping");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let _ = stream.set_nodelay(true);
                        let handler = ConnectionHandler::new(gateway.clone(), peer, transport.child_token());
                        let config = Arc::clone(&config);
                        let transport = transport.clone();
                        gateway.tasks.spawn(async move {
                            let running = tokio::select! {
                                result = russh::server::run_stream(config, stream, handler) => match result {
                                    Ok(running) => running,
                                    Err(e) => {
                                        tracing::warn!(%peer, error = %e, "ssh handshake failed");
                                        return;
                                    }
                                },
                                _ = transport.cancelled() => return,
                            };
                            tokio::select! {
                                result = running => {
                                    if let Err(e) = result {
                                        tracing::debug!(%peer, error = %e, "connection ended with error");
                                    }
                                }
                                _ = transport.cancelled() => {
                                    tracing::debug!(%peer, "transport closed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Per-connection SSH handler. Dropped when the connection ends, which
/// cancels the session attached to it.
pub struct ConnectionHandler {
    gateway: Gateway,
    peer: SocketAddr,
    username: Option<String>,
    channel: Option<ChannelId>,
    pty: Option<TerminalSize>,
    input: Option<mpsc::UnboundedSender<Bytes>>,
    resize: Option<watch::Sender<TerminalSize>>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    fn new(gateway: Gateway, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            gateway,
            peer,
            username: None,
            channel: None,
            pty: None,
            input: None,
            resize: None,
            cancel,
        }
    }

    fn accept_user(&mut self, user: &str) -> Auth {
        tracing::debug!(peer = %self.peer, user, "authenticated");
        self.username = Some(user.to_string());
        Auth::Accept
    }

    fn start_session(&mut self, channel: ChannelId, size: TerminalSize, session: &mut SshSession) {
        let username = self.username.clone().unwrap_or_default();
        let guard = self.gateway.registry.register();

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(OUTPUT_BUFFER);
        let (resize_tx, resize_rx) = watch::channel(size);
        self.input = Some(input_tx);
        self.resize = Some(resize_tx);

        let actor = Session::new(
            Arc::clone(&self.gateway.cluster),
            Arc::clone(&self.gateway.settings),
            self.gateway.shutdown.clone(),
            Connection {
                username: username.clone(),
                size,
                input: input_rx,
                output: output_tx,
                resize: resize_rx,
                cancel: self.cancel.clone(),
            },
        );

        let handle = session.handle();
        let peer = self.peer;
        self.gateway.tasks.spawn(async move {
            let _guard = guard;
            let pump = async {
                while let Some(bytes) = output_rx.recv().await {
                    if handle.data(channel, CryptoVec::from_slice(&bytes)).await.is_err() {
                        break;
                    }
                }
            };
            let (report, ()) = tokio::join!(actor.run(), pump);

            let code = if report.final_state == State::Error { 1 } else { 0 };
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            tracing::info!(
                %peer,
                user = %username,
                state = %report.final_state,
                error = report.error.as_deref().unwrap_or(""),
                teardown = ?report.teardown,
                "connection finished"
            );
        });
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            tracing::debug!(peer = %self.peer, "rejecting second session channel");
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let size = TerminalSize::from_ssh(col_width, row_height);
        tracing::debug!(peer = %self.peer, term, width = size.width, height = size.height, "pty requested");
        self.pty = Some(size);
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let Some(size) = self.pty else {
            tracing::warn!(peer = %self.peer, user = ?self.username, "no active terminal");
            session.channel_failure(channel);
            session.data(channel, CryptoVec::from_slice(NO_TERMINAL_MESSAGE));
            session.exit_status_request(channel, 1);
            session.eof(channel);
            session.close(channel);
            return Ok(());
        };
        if self.input.is_some() {
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);
        self.start_session(channel, size, session);
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        if let Some(input) = &self.input {
            let _ = input.send(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let size = TerminalSize::from_ssh(col_width, row_height);
        match &self.resize {
            Some(resize) => {
                resize.send_replace(size);
            }
            None => self.pty = Some(size),
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.input = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.input = None;
        self.cancel.cancel();
        Ok(())
    }
}
