//! Channel multiplexer for SSH protocol 1.5 sessions.
//!
//! A [`TunnelController`] sits on top of an established, authenticated SSH1 packet stream and
//! multiplexes the interactive session, local and remote TCP port forwards and X11 forwards over
//! it. Channels go through the SSH1 half-close handshake (`INPUT_EOF` / `OUTPUT_CLOSED`) and are
//! released only once both sides closed both directions.

#[macro_use]
extern crate tracing;

mod api;
mod channel;
mod codec;
mod config;
mod error;
mod ftp;
mod hostmap;
mod listener;
mod plugin;
mod pump;
mod table;
mod transport;

pub use self::api::{SessionEvent, TunnelHandle};
pub use self::codec::PacketCodec;
pub use self::config::{
    ActiveProxy, FilteringRule, FtpConfig, LocalForward, RemoteForward, Target, TunnelConfig, DEFAULT_MAX_CHUNK_SIZE,
    MAXIMUM_CHUNK_SIZE,
};
pub use self::error::TunnelError;
pub use self::listener::{ListenerId, ListenerInfo};
pub use self::plugin::{
    GeneralPlugin, PayloadFilter, PluginContext, PluginRegistry, ProtocolPlugin, FTP_PLUGIN, GENERAL_PLUGIN,
};
pub use self::transport::{Cipher, Compressor, TransportCapabilities};
pub use ssh1_proto::{LocalChannelId, Message, RemoteChannelId};

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::Mutex;
use ssh1_proto::{ChannelData, ChannelOpenConfirmation, PortOpen, X11Open};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder as _, FramedRead};
use tracing::{Instrument as _, Span};

use self::api::{ApiRequestReceiver, ControllerRequest, SessionEventSender};
use self::channel::{ChannelCtx, ChannelKey, ChannelKind};
use self::hostmap::HostMap;
use self::listener::{ListenerEntry, ListenerTask};
use self::plugin::SharedFilter;
use self::pump::{DataReaderTask, DataWriterTask, StreamResolverTask};
use self::table::ChannelTable;

// The transport will require at most `chunk size × MESSAGE_MPSC_CHANNEL_SIZE` bytes to be kept alive.
const MESSAGE_MPSC_CHANNEL_SIZE: usize = 512;
const INTERNAL_MPSC_CHANNEL_SIZE: usize = 32;

/// Runs the channel multiplexer over an SSH1 packet stream.
pub struct TunnelController {
    cfg: TunnelConfig,
    plugins: PluginRegistry,
    inbound: TransportCapabilities,
    outbound: TransportCapabilities,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    handle: TunnelHandle,
    api_request_rx: ApiRequestReceiver,
    session_event_tx: Option<SessionEventSender>,
}

impl TunnelController {
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        let (api_request_tx, api_request_rx) = mpsc::unbounded_channel();

        Self {
            cfg: TunnelConfig::default(),
            plugins: PluginRegistry::default(),
            inbound: TransportCapabilities::default(),
            outbound: TransportCapabilities::default(),
            reader,
            writer,
            handle: TunnelHandle::new(api_request_tx),
            api_request_rx,
            session_event_tx: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: TunnelConfig) -> Self {
        self.cfg = cfg;
        self
    }

    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Cipher and compression state negotiated during the key exchange, one per direction.
    #[must_use]
    pub fn with_capabilities(mut self, inbound: TransportCapabilities, outbound: TransportCapabilities) -> Self {
        self.inbound = inbound;
        self.outbound = outbound;
        self
    }

    /// Where interactive session output and the end of the session are reported.
    #[must_use]
    pub fn with_session_events(mut self, session_event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.session_event_tx = Some(session_event_tx);
        self
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Runs until the transport is closed, a disconnect is exchanged or the remote command exits.
    ///
    /// Protocol violations are reported to the peer with a `DISCONNECT` and returned as errors.
    pub async fn run(self) -> anyhow::Result<()> {
        let span = Span::current();
        run_controller_impl(self, span.clone()).instrument(span).await
    }
}

async fn run_controller_impl(controller: TunnelController, span: Span) -> anyhow::Result<()> {
    let TunnelController {
        cfg,
        plugins,
        inbound,
        outbound,
        reader,
        writer,
        handle,
        api_request_rx,
        session_event_tx,
    } = controller;

    let (msg_to_send_tx, msg_to_send_rx) = mpsc::channel::<Message>(MESSAGE_MPSC_CHANNEL_SIZE);

    let packet_stream = FramedRead::new(reader, PacketCodec::new(inbound));

    let sender_task_handle = SenderTask {
        writer,
        codec: PacketCodec::new(outbound),
        msg_to_send_rx,
    }
    .spawn(span.clone());

    let scheduler_task_handle = SchedulerTask {
        cfg,
        plugins,
        packet_stream,
        msg_to_send_tx,
        handle,
        api_request_rx,
        session_event_tx,
        parent_span: span,
    }
    .spawn();

    let (scheduler_result, sender_result) =
        tokio::try_join!(scheduler_task_handle.join(), sender_task_handle.join()).context("task join failed")?;

    if let Err(error) = sender_result {
        debug!(error = format!("{error:#}"), "Sender task failed");
    }

    scheduler_result
}

// === implementation details === //

type MessageReceiver = mpsc::Receiver<Message>;
type MessageSender = mpsc::Sender<Message>;
pub(crate) type DataReceiver = mpsc::UnboundedReceiver<Bytes>;
pub(crate) type DataSender = mpsc::UnboundedSender<Bytes>;
pub(crate) type InternalMessageSender = mpsc::Sender<InternalMessage>;

/// Reports from the per-channel tasks. Stale reports, whose key no longer matches the channel
/// registered under that ID, are discarded.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    Data { key: ChannelKey, data: Bytes },
    ReadEof { key: ChannelKey },
    WriteClosed { key: ChannelKey },
    StreamResolved { key: ChannelKey, stream: TcpStream },
    ResolveFailed { key: ChannelKey },
}

enum Flow {
    Continue,
    Stop,
}

// === internal tasks === //

// ---------------------- //

struct SenderTask<T: AsyncWrite + Unpin + Send + 'static> {
    writer: T,
    codec: PacketCodec,
    msg_to_send_rx: MessageReceiver,
}

impl<T: AsyncWrite + Unpin + Send + 'static> SenderTask<T> {
    fn spawn(self, span: Span) -> ChildTask<anyhow::Result<()>> {
        let fut = self.run().instrument(span);
        ChildTask(tokio::spawn(fut))
    }

    #[instrument("sender", skip_all)]
    async fn run(self) -> anyhow::Result<()> {
        let Self {
            writer,
            mut codec,
            mut msg_to_send_rx,
        } = self;

        let mut writer = tokio::io::BufWriter::with_capacity(16 * 1024, writer);
        let mut buf = bytes::BytesMut::new();
        let mut needs_flush = false;

        loop {
            tokio::select! {
                msg = msg_to_send_rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };

                    trace!(?msg, "Send message");

                    buf.clear();
                    codec.encode(msg, &mut buf)?;

                    writer.write_all(&buf).await?;
                    needs_flush = true;
                }
                _ = tokio::time::sleep(core::time::Duration::from_millis(10)), if needs_flush => {
                    writer.flush().await?;
                    needs_flush = false;
                }
            }
        }

        info!("Closing sender task...");

        writer.flush().await?;

        Ok(())
    }
}

// ---------------------- //

struct SchedulerTask<T: AsyncRead + Unpin + Send + 'static> {
    cfg: TunnelConfig,
    plugins: PluginRegistry,
    packet_stream: FramedRead<T, PacketCodec>,
    msg_to_send_tx: MessageSender,
    handle: TunnelHandle,
    api_request_rx: ApiRequestReceiver,
    session_event_tx: Option<SessionEventSender>,
    parent_span: Span,
}

impl<T: AsyncRead + Unpin + Send + 'static> SchedulerTask<T> {
    fn spawn(self) -> ChildTask<anyhow::Result<()>> {
        let parent_span = self.parent_span.clone();
        let fut = scheduler_task_impl(self).instrument(parent_span);
        ChildTask(tokio::spawn(fut))
    }
}

#[instrument("scheduler", skip_all)]
async fn scheduler_task_impl<T: AsyncRead + Unpin + Send + 'static>(task: SchedulerTask<T>) -> anyhow::Result<()> {
    use futures_util::StreamExt as _;

    let SchedulerTask {
        cfg,
        plugins,
        mut packet_stream,
        msg_to_send_tx,
        handle,
        mut api_request_rx,
        session_event_tx,
        parent_span,
    } = task;

    let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel::<InternalMessage>(INTERNAL_MPSC_CHANNEL_SIZE);

    let mut ctx = ControllerCtx {
        cfg,
        plugins,
        handle,
        msg_to_send_tx,
        internal_msg_tx,
        session_event_tx,
        channels: ChannelTable::new(),
        listeners: BTreeMap::new(),
        host_map: HostMap::default(),
        next_serial: 0,
        next_listener_id: 0,
        parent_span,
    };

    ctx.start().await?;

    loop {
        // NOTE: Current task is the "scheduler". It exclusively owns the channel table and communicates with
        // the other tasks through channels. Blocking work must never be done here; waiting on the outgoing
        // message channel is the only backpressure point.

        // Requests go first: a host mapping added through the handle must be in place for any packet
        // read afterwards.
        let outcome = tokio::select! {
            biased;

            Some(request) = api_request_rx.recv() => ctx.on_request(request).await,
            Some(internal_msg) = internal_msg_rx.recv() => ctx.on_internal(internal_msg).await.map(|()| Flow::Continue),
            packet = packet_stream.next() => match packet {
                Some(Ok(packet)) => ctx.dispatch(packet).await,
                Some(Err(error)) if error.kind() == io::ErrorKind::InvalidData => {
                    Err(anyhow::Error::new(TunnelError::Framing(error.to_string())))
                }
                Some(Err(error)) => {
                    if is_really_an_error(&error) {
                        error!(%error, "Transport error");
                    } else {
                        info!(reason = %error, "Transport closed abruptly");
                    }
                    break;
                }
                None => {
                    info!("Transport was closed by peer");
                    break;
                }
            },
        };

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(error) => match error.downcast::<TunnelError>() {
                Ok(error) if error.is_fatal() => {
                    error!(%error, "Protocol violation");
                    ctx.disconnect(&error).await;
                    return Err(anyhow::Error::new(error));
                }
                Ok(error) => warn!(%error, "Channel failure"),
                Err(error) => return Err(error),
            },
        }
    }

    ctx.kill_all();

    info!("Closing scheduler task...");

    Ok(())
}

struct ControllerCtx {
    cfg: TunnelConfig,
    plugins: PluginRegistry,
    handle: TunnelHandle,
    msg_to_send_tx: MessageSender,
    internal_msg_tx: InternalMessageSender,
    session_event_tx: Option<SessionEventSender>,
    channels: ChannelTable<ChannelCtx>,
    listeners: BTreeMap<ListenerId, ListenerEntry>,
    host_map: HostMap,
    next_serial: u64,
    next_listener_id: u32,
    parent_span: Span,
}

impl Drop for ControllerCtx {
    fn drop(&mut self) {
        self.kill_all();
    }
}

impl ControllerCtx {
    async fn start(&mut self) -> anyhow::Result<()> {
        for forward in self.cfg.local_forwards.clone() {
            self.start_listener(forward)?;
        }

        for forward in self.cfg.remote_forwards.clone() {
            self.send(Message::port_forward_request(
                forward.server_port,
                forward.target.host,
                forward.target.port,
            ))
            .await?;
        }

        Ok(())
    }

    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        self.msg_to_send_tx
            .send(msg)
            .await
            .context("couldn't send message through mpsc channel")
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(session_event_tx) = &self.session_event_tx {
            let _ = session_event_tx.send(event);
        }
    }

    async fn disconnect(&mut self, error: &TunnelError) {
        // The sender task is likely still alive and will flush this before shutting down.
        if let Err(error) = self.send(Message::disconnect(error.to_string())).await {
            debug!(error = format!("{error:#}"), "Couldn't send DISCONNECT message");
        }

        self.kill_all();
    }

    /// Tears down every channel without the half-close handshake and stops every listener.
    fn kill_all(&mut self) {
        for id in self.channels.ids() {
            if let Ok(mut channel) = self.channels.deregister(id) {
                channel.abort();
                channel.span.in_scope(|| debug!("Channel killed"));
            }
        }

        for (_, listener) in core::mem::take(&mut self.listeners) {
            listener.stop();
        }
    }

    fn next_key(&mut self, id: LocalChannelId) -> ChannelKey {
        self.next_serial += 1;
        ChannelKey {
            id,
            serial: self.next_serial,
        }
    }

    fn channel_span(&self, id: LocalChannelId, kind: ChannelKind, target: &str) -> Span {
        info_span!(parent: self.parent_span.clone(), "channel", local_id = %id, remote_id = tracing::field::Empty, %kind, %target)
    }

    fn channel_mut(&mut self, id: u32) -> Result<&mut ChannelCtx, TunnelError> {
        let id = LocalChannelId::from(id);
        self.channels.get_mut(id).ok_or(TunnelError::UnknownChannel { id })
    }

    fn channel_by_key(&mut self, key: ChannelKey) -> Option<&mut ChannelCtx> {
        self.channels.get_mut(key.id).filter(|channel| channel.key == key)
    }

    fn check_termination(&mut self, id: LocalChannelId) {
        let terminated = self
            .channels
            .get(id)
            .is_some_and(|channel| channel.half_close.is_terminated());

        if terminated {
            if let Ok(mut channel) = self.channels.deregister(id) {
                channel.abort();
                let remaining = self.channels.len();
                channel.span.in_scope(|| debug!(remaining, "Channel closed"));
            }
        }
    }

    // --- listeners --- //

    fn start_listener(&mut self, forward: LocalForward) -> anyhow::Result<ListenerInfo> {
        let plugin = self
            .plugins
            .get(&forward.plugin)
            .with_context(|| format!("unknown plugin `{}`", forward.plugin))?;

        let listener = plugin
            .local_listener(&forward)
            .with_context(|| format!("couldn't bind listener to {}:{}", forward.bind_host, forward.bind_port))?;

        self.adopt_listener(listener, forward.bind_host, forward.target, forward.plugin, false)
    }

    fn adopt_listener(
        &mut self,
        listener: std::net::TcpListener,
        bind_host: String,
        target: Target,
        plugin: String,
        temporary: bool,
    ) -> anyhow::Result<ListenerInfo> {
        let listener = tokio::net::TcpListener::from_std(listener).context("couldn't register listener")?;
        let local_addr = listener.local_addr().context("couldn't get listener address")?;

        let id = ListenerId::from(self.next_listener_id);
        self.next_listener_id += 1;

        let info = ListenerInfo {
            id,
            local_addr,
            bind_host,
            target,
            plugin,
            temporary,
        };

        info!(listener = %info.describe(), "Start listener");

        let entry = ListenerTask {
            id,
            listener,
            temporary,
            handle: self.handle.clone(),
        }
        .spawn(info.clone(), &self.parent_span);

        self.listeners.insert(id, entry);

        Ok(info)
    }

    fn kill_listener(&mut self, local_host: &str, local_port: u16) -> bool {
        let found = self
            .listeners
            .iter()
            .find(|(_, entry)| entry.info.is_bound_to(local_host, local_port))
            .map(|(id, _)| *id);

        match found.and_then(|id| self.listeners.remove(&id)) {
            Some(entry) => {
                info!(listener = %entry.info.describe(), "Stop listener");
                entry.stop();
                true
            }
            None => false,
        }
    }

    async fn on_accepted(
        &mut self,
        listener_id: ListenerId,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listeners.get(&listener_id) else {
            debug!(%listener_id, %peer_addr, "Connection accepted by a stopped listener");
            return Ok(());
        };

        let target = listener.info.target.clone();
        let plugin = listener.info.plugin.clone();

        let id = self.channels.allocate()?;
        let key = self.next_key(id);
        let span = self.channel_span(id, ChannelKind::LocalForward, &target.to_string());

        let mut channel = ChannelCtx::new(
            key,
            ChannelKind::LocalForward,
            peer_addr.to_string(),
            target.to_string(),
            span,
        );
        channel.plugin = plugin;
        channel.stream = Some(stream);
        channel.span.in_scope(|| debug!(%peer_addr, "Request channel"));

        self.channels.register(id, channel)?;

        self.send(Message::port_open(id, target.host, target.port, None)).await
    }

    // --- front-end requests --- //

    async fn on_request(&mut self, request: ControllerRequest) -> anyhow::Result<Flow> {
        match request {
            ControllerRequest::NewListenChannel {
                forward,
                api_response_tx,
            } => {
                let result = self.start_listener(forward);
                if let Err(error) = &result {
                    warn!(error = format!("{error:#}"), "Couldn't start listener");
                }
                let _ = api_response_tx.send(result);
            }
            ControllerRequest::KillListenChannel {
                local_host,
                local_port,
                api_response_tx,
            } => {
                let _ = api_response_tx.send(self.kill_listener(&local_host, local_port));
            }
            ControllerRequest::ListListeners { api_response_tx } => {
                let listing = self.listeners.values().map(|entry| entry.info.describe()).collect();
                let _ = api_response_tx.send(listing);
            }
            ControllerRequest::ListTunnels { api_response_tx } => {
                let listing = self.channels.iter().map(|(_, channel)| channel.describe()).collect();
                let _ = api_response_tx.send(listing);
            }
            ControllerRequest::CloseTunnelFromList { index, api_response_tx } => {
                let closed = match self.channels.ids().get(index).copied() {
                    Some(id) => {
                        self.close_tunnel(id);
                        true
                    }
                    None => false,
                };
                let _ = api_response_tx.send(closed);
            }
            ControllerRequest::AddHostMap {
                from_host,
                to_host,
                to_port,
                temporary,
            } => {
                self.host_map.add(from_host, to_host, to_port, temporary);
            }
            ControllerRequest::DelHostMap {
                from_host,
                api_response_tx,
            } => {
                let _ = api_response_tx.send(self.host_map.del(&from_host));
            }
            ControllerRequest::RequestRemoteForward { forward } => {
                info!(server_port = forward.server_port, target = %forward.target, "Request remote forward");
                self.send(Message::port_forward_request(
                    forward.server_port,
                    forward.target.host.clone(),
                    forward.target.port,
                ))
                .await?;
                self.cfg.remote_forwards.push(forward);
            }
            ControllerRequest::SendStdin { data } => {
                self.send(Message::StdinData(data)).await?;
            }
            ControllerRequest::SendStdinEof => {
                self.send(Message::Eof).await?;
            }
            ControllerRequest::KillAll => {
                info!("Kill all channels");
                self.kill_all();
                return Ok(Flow::Stop);
            }
            ControllerRequest::Accepted {
                listener_id,
                stream,
                peer_addr,
            } => {
                self.on_accepted(listener_id, stream, peer_addr).await?;
            }
            ControllerRequest::AdoptListener {
                listener,
                target,
                temporary,
            } => {
                let bind_host = listener
                    .local_addr()
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_default();

                if let Err(error) =
                    self.adopt_listener(listener, bind_host, target, GENERAL_PLUGIN.to_owned(), temporary)
                {
                    warn!(error = format!("{error:#}"), "Couldn't adopt listener");
                }
            }
            ControllerRequest::ListenerClosed { listener_id } => {
                if let Some(entry) = self.listeners.remove(&listener_id) {
                    debug!(listener = %entry.info.describe(), "Listener removed");
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Starts the half-close handshake from our side.
    fn close_tunnel(&mut self, id: LocalChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };

        channel.span.in_scope(|| debug!("Close requested"));

        if channel.started {
            // The reader reports its EOF, the writer drains and reports its closure.
            channel.reader_cancel.cancel();
            channel.data_tx = None;
            return;
        }

        channel.closing = true;

        if channel.kind == ChannelKind::LocalForward {
            channel.stream = None;
        }
    }

    // --- inbound packets --- //

    async fn dispatch(&mut self, packet: Bytes) -> anyhow::Result<Flow> {
        let message = Message::decode(packet).map_err(TunnelError::from)?;

        trace!(?message, "Received message");

        match message {
            Message::Data(msg) => self.on_data(msg)?,
            Message::OpenConfirmation(msg) => self.on_open_confirmation(msg).await?,
            Message::OpenFailure(msg) => self.on_open_failure(msg.recipient_channel_id)?,
            Message::InputEof(msg) => self.on_input_eof(msg.recipient_channel_id)?,
            Message::OutputClosed(msg) => self.on_output_closed(msg.recipient_channel_id).await?,
            Message::PortOpen(msg) => self.on_port_open(msg).await?,
            Message::X11Open(msg) => self.on_x11_open(msg).await?,
            Message::StdoutData(data) => self.emit(SessionEvent::Stdout(data)),
            Message::StderrData(data) => self.emit(SessionEvent::Stderr(data)),
            Message::ExitStatus(status) => {
                info!(status, "Remote command exited");
                self.send(Message::ExitConfirmation).await?;
                self.emit(SessionEvent::ExitStatus(status));
                return Ok(Flow::Stop);
            }
            Message::Disconnect(msg) => {
                info!(reason = %msg.reason, "Peer disconnected");
                self.emit(SessionEvent::Disconnected(msg.reason));
                return Ok(Flow::Stop);
            }
            Message::Success => debug!("Request accepted by peer"),
            Message::Failure => warn!("Request refused by peer"),
            Message::Ignore(_) => {}
            Message::Debug(text) => debug!(%text, "Peer debug message"),
            Message::PortForwardRequest(msg) => {
                debug!(server_port = msg.server_port, "Refusing port forward request from peer");
                self.send(Message::Failure).await?;
            }
            msg @ (Message::StdinData(_) | Message::Eof | Message::ExitConfirmation) => {
                debug!(ty = %msg.ty(), "Ignoring client-side message");
            }
        }

        Ok(Flow::Continue)
    }

    fn on_data(&mut self, msg: ChannelData) -> Result<(), TunnelError> {
        let channel = self.channel_mut(msg.recipient_channel_id)?;

        match &channel.data_tx {
            Some(data_tx) => {
                // The writer may be gone already after a local write failure.
                let _ = data_tx.send(msg.data);
            }
            None => channel.span.in_scope(|| {
                debug!(len = msg.data.len(), "Data received while the local side is not writable was dropped");
            }),
        }

        Ok(())
    }

    async fn on_open_confirmation(&mut self, msg: ChannelOpenConfirmation) -> anyhow::Result<()> {
        let channel = self.channel_mut(msg.recipient_channel_id)?;
        let remote_id = RemoteChannelId::from(msg.sender_channel_id);

        channel.set_remote_id(remote_id)?;
        channel.remote_desc = Some(format!("remote {remote_id}"));
        channel.span.in_scope(|| debug!("Channel opened"));

        let id = channel.local_id();

        if channel.closing {
            self.close_unstarted(id).await
        } else {
            self.start_pumps(id);
            Ok(())
        }
    }

    fn on_open_failure(&mut self, raw_id: u32) -> Result<(), TunnelError> {
        let channel = self.channel_mut(raw_id)?;

        if channel.remote_id().is_some() {
            return Err(TunnelError::AlreadyOpen { id: channel.local_id() });
        }

        let id = channel.local_id();
        let mut channel = self.channels.deregister(id)?;
        channel.abort();

        let _enter = channel.span.enter();
        warn!(error = %TunnelError::OpenRejected { id }, target = %channel.target, "Channel opening failed");

        Ok(())
    }

    fn on_input_eof(&mut self, raw_id: u32) -> Result<(), TunnelError> {
        let channel = self.channel_mut(raw_id)?;

        if !channel.half_close.mark_received_input_eof() {
            channel.span.in_scope(|| debug!("Duplicate INPUT_EOF ignored"));
            return Ok(());
        }

        channel.span.in_scope(|| debug!("Peer EOFed"));

        // Lets the writer drain what is queued, then shut the local write side down.
        channel.data_tx = None;

        let id = channel.local_id();
        self.check_termination(id);

        Ok(())
    }

    async fn on_output_closed(&mut self, raw_id: u32) -> anyhow::Result<()> {
        let channel = self.channel_mut(raw_id)?;

        if !channel.half_close.mark_received_output_closed() {
            channel.span.in_scope(|| debug!("Duplicate OUTPUT_CLOSED ignored"));
            return Ok(());
        }

        channel.span.in_scope(|| debug!("Peer closed its output"));

        channel.reader_cancel.cancel();

        let id = channel.local_id();
        let remote_id = channel.remote_id();

        if let Some(remote_id) = remote_id {
            if channel.half_close.mark_sent_input_eof() {
                self.send(Message::input_eof(remote_id)).await?;
            }
        }

        self.check_termination(id);

        Ok(())
    }

    async fn on_port_open(&mut self, msg: PortOpen) -> anyhow::Result<()> {
        let PortOpen {
            sender_channel_id,
            host,
            port,
            originator,
        } = msg;

        let remote_id = RemoteChannelId::from(sender_channel_id);

        match self.resolve_remote_target(&host, port) {
            Some((target, plugin)) => {
                let origin = originator.unwrap_or_else(|| format!("{host}:{port}"));
                self.open_remote_initiated(remote_id, ChannelKind::RemoteForward, origin, target, plugin)
                    .await
            }
            None => {
                info!(%remote_id, %host, port, "Refused connection to a target that was not requested");
                self.send(Message::open_failure(remote_id)).await
            }
        }
    }

    async fn on_x11_open(&mut self, msg: X11Open) -> anyhow::Result<()> {
        let remote_id = RemoteChannelId::from(msg.sender_channel_id);

        match self.cfg.x11_target.clone() {
            Some(target) => {
                let origin = msg.originator.unwrap_or_else(|| "x11".to_owned());
                self.open_remote_initiated(remote_id, ChannelKind::X11, origin, target, GENERAL_PLUGIN.to_owned())
                    .await
            }
            None => {
                info!(%remote_id, "Refused X11 connection, X11 forwarding is not enabled");
                self.send(Message::open_failure(remote_id)).await
            }
        }
    }

    /// Where a peer-initiated connection to `host:port` should go, and through which plugin.
    fn resolve_remote_target(&mut self, host: &str, port: u16) -> Option<(Target, String)> {
        if let Some((to_host, to_port)) = self.host_map.resolve(host) {
            return Some((Target::new(to_host, to_port), GENERAL_PLUGIN.to_owned()));
        }

        if let Some(forward) = self
            .cfg
            .remote_forwards
            .iter()
            .find(|forward| forward.target.host == host && forward.target.port == port)
        {
            return Some((forward.target.clone(), forward.plugin.clone()));
        }

        if self.cfg.filtering.is_allowed(host, port) {
            return Some((Target::new(host, port), GENERAL_PLUGIN.to_owned()));
        }

        None
    }

    async fn open_remote_initiated(
        &mut self,
        remote_id: RemoteChannelId,
        kind: ChannelKind,
        origin: String,
        target: Target,
        plugin: String,
    ) -> anyhow::Result<()> {
        let id = match self.channels.allocate() {
            Ok(id) => id,
            Err(error) => {
                warn!(%error, %remote_id, "Couldn't allocate local ID");
                return self.send(Message::open_failure(remote_id)).await;
            }
        };

        let key = self.next_key(id);
        let span = self.channel_span(id, kind, &target.to_string());

        let mut channel = ChannelCtx::new(key, kind, origin, target.to_string(), span);
        channel.plugin = plugin;
        channel.set_remote_id(remote_id)?;
        channel.remote_desc = Some(format!("remote {remote_id}"));
        channel.span.in_scope(|| info!("Peer requested channel"));

        StreamResolverTask {
            key,
            target,
            internal_msg_tx: self.internal_msg_tx.clone(),
        }
        .spawn(channel.span.clone())
        .detach();

        self.channels.register(id, channel)?;

        Ok(())
    }

    // --- channel tasks --- //

    async fn on_internal(&mut self, msg: InternalMessage) -> anyhow::Result<()> {
        match msg {
            InternalMessage::Data { key, data } => {
                let Some(channel) = self.channel_by_key(key) else {
                    return Ok(());
                };

                // Nothing may follow our INPUT_EOF.
                if channel.half_close.sent_input_eof() {
                    return Ok(());
                }

                if let Some(remote_id) = channel.remote_id() {
                    self.send(Message::data(remote_id, data)).await?;
                }
            }
            InternalMessage::ReadEof { key } => {
                let Some(channel) = self.channel_by_key(key) else {
                    return Ok(());
                };

                let id = key.id;

                if let Some(remote_id) = channel.remote_id() {
                    if channel.half_close.mark_sent_input_eof() {
                        channel.span.in_scope(|| debug!("Local EOF"));
                        self.send(Message::input_eof(remote_id)).await?;
                    }
                }

                self.check_termination(id);
            }
            InternalMessage::WriteClosed { key } => {
                let Some(channel) = self.channel_by_key(key) else {
                    return Ok(());
                };

                let id = key.id;
                channel.data_tx = None;

                if let Some(remote_id) = channel.remote_id() {
                    if channel.half_close.mark_sent_output_closed() {
                        channel.span.in_scope(|| debug!("Local output closed"));
                        self.send(Message::output_closed(remote_id)).await?;
                    }
                }

                self.check_termination(id);
            }
            InternalMessage::StreamResolved { key, stream } => {
                let Some(channel) = self.channel_by_key(key) else {
                    return Ok(());
                };

                let Some(remote_id) = channel.remote_id() else {
                    return Ok(());
                };

                if channel.closing {
                    drop(stream);
                    return self.reject_remote_initiated(key.id, remote_id).await;
                }

                channel.stream = Some(stream);
                channel.span.in_scope(|| debug!("Channel accepted"));

                self.send(Message::open_confirmation(remote_id, key.id)).await?;
                self.start_pumps(key.id);
            }
            InternalMessage::ResolveFailed { key } => {
                let Some(remote_id) = self.channel_by_key(key).and_then(|channel| channel.remote_id()) else {
                    return Ok(());
                };

                self.reject_remote_initiated(key.id, remote_id).await?;
            }
        }

        Ok(())
    }

    async fn reject_remote_initiated(&mut self, id: LocalChannelId, remote_id: RemoteChannelId) -> anyhow::Result<()> {
        if let Ok(mut channel) = self.channels.deregister(id) {
            channel.abort();
            channel.span.in_scope(|| debug!("Channel refused"));
        }

        self.send(Message::open_failure(remote_id)).await
    }

    /// Ends a channel whose pumps never started, once its remote ID is known.
    async fn close_unstarted(&mut self, id: LocalChannelId) -> anyhow::Result<()> {
        let Some(channel) = self.channels.get_mut(id) else {
            return Ok(());
        };

        let Some(remote_id) = channel.remote_id() else {
            return Ok(());
        };

        channel.stream = None;
        channel.reader_cancel.cancel();

        let send_input_eof = channel.half_close.mark_sent_input_eof();
        let send_output_closed = channel.half_close.mark_sent_output_closed();

        if send_input_eof {
            self.send(Message::input_eof(remote_id)).await?;
        }

        if send_output_closed {
            self.send(Message::output_closed(remote_id)).await?;
        }

        self.check_termination(id);

        Ok(())
    }

    fn start_pumps(&mut self, id: LocalChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };

        let Some(stream) = channel.stream.take() else {
            return;
        };

        let local_ip = stream
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let filter: Option<SharedFilter> = self
            .plugins
            .get(&channel.plugin)
            .and_then(|plugin| {
                plugin.new_filter(&PluginContext {
                    handle: self.handle.clone(),
                    local_ip,
                    ftp: self.cfg.ftp.clone(),
                })
            })
            .map(|filter| Arc::new(Mutex::new(filter)));

        let (reader, writer) = stream.into_split();
        let (data_tx, data_rx) = mpsc::unbounded_channel::<Bytes>();

        DataWriterTask {
            writer,
            data_rx,
            key: channel.key,
            filter: filter.clone(),
            internal_msg_tx: self.internal_msg_tx.clone(),
            stop: channel.cancel.clone(),
        }
        .spawn(channel.span.clone())
        .detach();

        DataReaderTask {
            reader,
            key: channel.key,
            chunk_size: self.cfg.chunk_size(),
            filter,
            internal_msg_tx: self.internal_msg_tx.clone(),
            stop: channel.reader_cancel.clone(),
        }
        .spawn(channel.span.clone())
        .detach();

        channel.started = true;

        // An INPUT_EOF may already be in: the writer then closes right away.
        if !channel.half_close.received_input_eof() {
            channel.data_tx = Some(data_tx);
        }

        channel.span.in_scope(|| trace!("Pumps started"));
    }
}

/// Aborts the running task when dropped.
/// Also see https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub(crate) struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    fn abort(&self) {
        self.0.abort()
    }

    pub(crate) fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Walks source chain and check for status codes like ECONNRESET or ECONNABORTED that we don’t consider to be actual errors
pub(crate) fn is_really_an_error(original_error: &(dyn std::error::Error + 'static)) -> bool {
    let mut dyn_error: Option<&dyn std::error::Error> = Some(original_error);

    while let Some(source_error) = dyn_error.take() {
        if let Some(io_error) = source_error.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => {
                    return false;
                }
                _ => {}
            }
        }

        dyn_error = source_error.source();
    }

    true
}
