use core::fmt;

use ssh1_proto::{LocalChannelId, RemoteChannelId};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::{DataSender, TunnelError};

/// The four monotonic flags of the SSH1 half-close handshake.
///
/// Every `mark_*` method returns `true` only the first time the flag is raised, so callers
/// send the corresponding message exactly once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HalfClose {
    sent_input_eof: bool,
    sent_output_closed: bool,
    received_input_eof: bool,
    received_output_closed: bool,
}

fn raise(flag: &mut bool) -> bool {
    !core::mem::replace(flag, true)
}

impl HalfClose {
    pub(crate) fn mark_sent_input_eof(&mut self) -> bool {
        raise(&mut self.sent_input_eof)
    }

    pub(crate) fn mark_sent_output_closed(&mut self) -> bool {
        raise(&mut self.sent_output_closed)
    }

    pub(crate) fn mark_received_input_eof(&mut self) -> bool {
        raise(&mut self.received_input_eof)
    }

    pub(crate) fn mark_received_output_closed(&mut self) -> bool {
        raise(&mut self.received_output_closed)
    }

    pub(crate) fn sent_input_eof(&self) -> bool {
        self.sent_input_eof
    }

    pub(crate) fn received_input_eof(&self) -> bool {
        self.received_input_eof
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.sent_input_eof && self.sent_output_closed && self.received_input_eof && self.received_output_closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    /// Accepted on one of our listeners and opened towards the peer.
    LocalForward,
    /// Opened by the peer for one of the requested remote forwards.
    RemoteForward,
    /// Opened by the peer for the X11 display.
    X11,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::LocalForward => write!(f, "local"),
            ChannelKind::RemoteForward => write!(f, "remote"),
            ChannelKind::X11 => write!(f, "x11"),
        }
    }
}

/// Identifies one incarnation of a channel.
///
/// Local IDs are reused as soon as they are released, so messages coming back from the
/// tasks of a channel carry the serial number as well and stale ones are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChannelKey {
    pub(crate) id: LocalChannelId,
    pub(crate) serial: u64,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

pub(crate) struct ChannelCtx {
    pub(crate) key: ChannelKey,
    pub(crate) kind: ChannelKind,
    remote_id: Option<RemoteChannelId>,
    pub(crate) half_close: HalfClose,

    /// Peer address of the accepted socket, or the originator announced by the peer.
    pub(crate) origin: String,
    /// `host:port` on the far side of the tunnel.
    pub(crate) target: String,
    /// Diagnostics only.
    pub(crate) remote_desc: Option<String>,
    pub(crate) plugin: String,
    /// A local close was requested before the pumps were started.
    pub(crate) closing: bool,
    pub(crate) started: bool,

    /// Socket waiting for the pumps to start.
    pub(crate) stream: Option<TcpStream>,
    /// Queue feeding the writer pump. Dropping it lets the writer drain and close.
    pub(crate) data_tx: Option<DataSender>,

    /// Stops both pumps.
    pub(crate) cancel: CancellationToken,
    /// Stops the reader pump only.
    pub(crate) reader_cancel: CancellationToken,

    pub(crate) span: Span,
}

impl fmt::Debug for ChannelCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCtx")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("remote_id", &self.remote_id)
            .field("half_close", &self.half_close)
            .field("origin", &self.origin)
            .field("target", &self.target)
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl ChannelCtx {
    pub(crate) fn new(key: ChannelKey, kind: ChannelKind, origin: String, target: String, span: Span) -> Self {
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.child_token();

        Self {
            key,
            kind,
            remote_id: None,
            half_close: HalfClose::default(),
            origin,
            target,
            remote_desc: None,
            plugin: crate::plugin::GENERAL_PLUGIN.to_owned(),
            closing: false,
            started: false,
            stream: None,
            data_tx: None,
            cancel,
            reader_cancel,
            span,
        }
    }

    pub(crate) fn local_id(&self) -> LocalChannelId {
        self.key.id
    }

    pub(crate) fn remote_id(&self) -> Option<RemoteChannelId> {
        self.remote_id
    }

    /// The remote ID can be assigned only once.
    pub(crate) fn set_remote_id(&mut self, id: RemoteChannelId) -> Result<(), TunnelError> {
        if self.remote_id.is_some() {
            return Err(TunnelError::AlreadyOpen { id: self.key.id });
        }

        self.remote_id = Some(id);
        self.span.record("remote_id", tracing::field::display(id));

        Ok(())
    }

    /// One line of the tunnel listing.
    pub(crate) fn describe(&self) -> String {
        match &self.remote_desc {
            Some(remote_desc) => format!("{} {} -> {} [{}]", self.key.id, self.origin, self.target, remote_desc),
            None => format!("{} {} -> {}", self.key.id, self.origin, self.target),
        }
    }

    /// Releases everything owned by the channel without going through the handshake.
    pub(crate) fn abort(&mut self) {
        self.cancel.cancel();
        self.data_tx = None;
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn channel() -> ChannelCtx {
        ChannelCtx::new(
            ChannelKey {
                id: LocalChannelId::from(0),
                serial: 1,
            },
            ChannelKind::LocalForward,
            "127.0.0.1:50000".to_owned(),
            "127.0.0.1:80".to_owned(),
            Span::none(),
        )
    }

    #[test]
    fn flags_are_raised_once() {
        let mut flags = HalfClose::default();

        assert!(flags.mark_sent_input_eof());
        assert!(!flags.mark_sent_input_eof());
        assert!(flags.sent_input_eof());

        assert!(flags.mark_received_output_closed());
        assert!(!flags.mark_received_output_closed());

        assert!(!flags.received_input_eof());
        assert!(flags.mark_sent_output_closed());
    }

    #[test]
    fn terminated_only_with_all_four_flags() {
        let mut flags = HalfClose::default();

        flags.mark_sent_input_eof();
        flags.mark_received_input_eof();
        flags.mark_sent_output_closed();
        assert!(!flags.is_terminated());

        flags.mark_received_output_closed();
        assert!(flags.is_terminated());
    }

    #[test]
    fn termination_in_any_order() {
        use proptest::prelude::*;

        proptest!(|(order in Just(vec![0u8, 1, 2, 3]).prop_shuffle(), repeats in 1usize..3)| {
            let mut flags = HalfClose::default();
            let mut terminations = 0;

            for _ in 0..repeats {
                for flag in &order {
                    let was_terminated = flags.is_terminated();
                    match flag {
                        0 => flags.mark_sent_input_eof(),
                        1 => flags.mark_sent_output_closed(),
                        2 => flags.mark_received_input_eof(),
                        _ => flags.mark_received_output_closed(),
                    };
                    if !was_terminated && flags.is_terminated() {
                        terminations += 1;
                    }
                }
            }

            prop_assert_eq!(1, terminations);
        })
    }

    #[test]
    fn remote_id_is_set_once() {
        let mut channel = channel();
        channel.set_remote_id(RemoteChannelId::from(7)).unwrap();

        let error = channel.set_remote_id(RemoteChannelId::from(8)).unwrap_err();
        assert!(matches!(error, TunnelError::AlreadyOpen { .. }));
        assert_eq!(Some(RemoteChannelId::from(7)), channel.remote_id());
    }

    #[test]
    fn description() {
        let mut channel = channel();
        assert_eq!("l#0 127.0.0.1:50000 -> 127.0.0.1:80", channel.describe());

        channel.remote_desc = Some("ftp".to_owned());
        assert_eq!("l#0 127.0.0.1:50000 -> 127.0.0.1:80 [ftp]", channel.describe());
    }

    #[test]
    fn abort_cancels_both_pumps() {
        let mut channel = channel();
        channel.abort();

        assert!(channel.cancel.is_cancelled());
        assert!(channel.reader_cancel.is_cancelled());
    }
}
