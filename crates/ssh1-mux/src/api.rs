use std::net::SocketAddr;

use anyhow::Context as _;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::{LocalForward, RemoteForward, Target};
use crate::listener::{ListenerId, ListenerInfo};

pub(crate) type ApiRequestSender = mpsc::UnboundedSender<ControllerRequest>;
pub(crate) type ApiRequestReceiver = mpsc::UnboundedReceiver<ControllerRequest>;
pub(crate) type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug)]
pub(crate) enum ControllerRequest {
    NewListenChannel {
        forward: LocalForward,
        api_response_tx: oneshot::Sender<anyhow::Result<ListenerInfo>>,
    },
    KillListenChannel {
        local_host: String,
        local_port: u16,
        api_response_tx: oneshot::Sender<bool>,
    },
    ListListeners {
        api_response_tx: oneshot::Sender<Vec<String>>,
    },
    ListTunnels {
        api_response_tx: oneshot::Sender<Vec<String>>,
    },
    CloseTunnelFromList {
        index: usize,
        api_response_tx: oneshot::Sender<bool>,
    },
    AddHostMap {
        from_host: String,
        to_host: String,
        to_port: u16,
        temporary: bool,
    },
    DelHostMap {
        from_host: String,
        api_response_tx: oneshot::Sender<bool>,
    },
    RequestRemoteForward {
        forward: RemoteForward,
    },
    SendStdin {
        data: Bytes,
    },
    SendStdinEof,
    KillAll,

    // Sent by listeners and plugins.
    Accepted {
        listener_id: ListenerId,
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    AdoptListener {
        listener: std::net::TcpListener,
        target: Target,
        temporary: bool,
    },
    ListenerClosed {
        listener_id: ListenerId,
    },
}

/// What happens on the interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The remote command exited; the controller stops right after.
    ExitStatus(u32),
    /// The peer closed the connection with the given reason.
    Disconnected(String),
}

/// Cloneable front end of a running [`TunnelController`](crate::TunnelController).
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    request_tx: ApiRequestSender,
}

impl TunnelHandle {
    pub(crate) fn new(request_tx: ApiRequestSender) -> Self {
        Self { request_tx }
    }

    fn request(&self, request: ControllerRequest) -> anyhow::Result<()> {
        self.request_tx
            .send(request)
            .ok()
            .context("tunnel controller is not running")
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControllerRequest) -> anyhow::Result<T> {
        let (api_response_tx, api_response_rx) = oneshot::channel();
        self.request(make(api_response_tx))?;
        api_response_rx.await.context("tunnel controller dropped the request")
    }

    /// Starts listening locally and forwards accepted connections through the peer.
    pub async fn new_listen_channel(&self, forward: LocalForward) -> anyhow::Result<ListenerInfo> {
        self.call(|api_response_tx| ControllerRequest::NewListenChannel {
            forward,
            api_response_tx,
        })
        .await?
    }

    /// Stops the listener bound to `local_host:local_port`. Returns `false` if there is none.
    pub async fn kill_listen_channel(&self, local_host: impl Into<String>, local_port: u16) -> anyhow::Result<bool> {
        let local_host = local_host.into();
        self.call(|api_response_tx| ControllerRequest::KillListenChannel {
            local_host,
            local_port,
            api_response_tx,
        })
        .await
    }

    pub async fn list_listeners(&self) -> anyhow::Result<Vec<String>> {
        self.call(|api_response_tx| ControllerRequest::ListListeners { api_response_tx })
            .await
    }

    /// Live channels, in ascending local ID order.
    pub async fn list_tunnels(&self) -> anyhow::Result<Vec<String>> {
        self.call(|api_response_tx| ControllerRequest::ListTunnels { api_response_tx })
            .await
    }

    /// Closes the channel at `index` in the [`list_tunnels`](Self::list_tunnels) listing.
    pub async fn close_tunnel_from_list(&self, index: usize) -> anyhow::Result<bool> {
        self.call(|api_response_tx| ControllerRequest::CloseTunnelFromList { index, api_response_tx })
            .await
    }

    /// Redirects the next peer-initiated open to `from_host`.
    pub fn add_host_map_temporary(
        &self,
        from_host: impl Into<String>,
        to_host: impl Into<String>,
        to_port: u16,
    ) -> anyhow::Result<()> {
        self.request(ControllerRequest::AddHostMap {
            from_host: from_host.into(),
            to_host: to_host.into(),
            to_port,
            temporary: true,
        })
    }

    pub fn add_host_map_permanent(
        &self,
        from_host: impl Into<String>,
        to_host: impl Into<String>,
        to_port: u16,
    ) -> anyhow::Result<()> {
        self.request(ControllerRequest::AddHostMap {
            from_host: from_host.into(),
            to_host: to_host.into(),
            to_port,
            temporary: false,
        })
    }

    pub async fn del_host_map(&self, from_host: impl Into<String>) -> anyhow::Result<bool> {
        let from_host = from_host.into();
        self.call(|api_response_tx| ControllerRequest::DelHostMap {
            from_host,
            api_response_tx,
        })
        .await
    }

    /// Asks the peer to listen on a port and to open channels back to a local target.
    pub fn request_remote_forward(&self, forward: RemoteForward) -> anyhow::Result<()> {
        self.request(ControllerRequest::RequestRemoteForward { forward })
    }

    pub fn send_stdin(&self, data: Bytes) -> anyhow::Result<()> {
        self.request(ControllerRequest::SendStdin { data })
    }

    pub fn send_stdin_eof(&self) -> anyhow::Result<()> {
        self.request(ControllerRequest::SendStdinEof)
    }

    /// Tears every channel and listener down and ends the session.
    pub fn kill_all(&self) -> anyhow::Result<()> {
        self.request(ControllerRequest::KillAll)
    }

    pub(crate) fn accepted(
        &self,
        listener_id: ListenerId,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        self.request(ControllerRequest::Accepted {
            listener_id,
            stream,
            peer_addr,
        })
    }

    pub(crate) fn adopt_listener(
        &self,
        listener: std::net::TcpListener,
        target: Target,
        temporary: bool,
    ) -> anyhow::Result<()> {
        self.request(ControllerRequest::AdoptListener {
            listener,
            target,
            temporary,
        })
    }

    pub(crate) fn listener_closed(&self, listener_id: ListenerId) {
        let _ = self.request(ControllerRequest::ListenerClosed { listener_id });
    }
}
