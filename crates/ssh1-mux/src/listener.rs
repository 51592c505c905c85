use core::fmt;
use core::time::Duration;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Span};

use crate::api::TunnelHandle;
use crate::config::Target;
use crate::ChildTask;

/// Pause before accepting again after a transient failure, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u32);

impl From<u32> for ListenerId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L#{}", self.0)
    }
}

/// A local listener whose connections are forwarded through the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: ListenerId,
    /// Address actually bound, with the port resolved when 0 was requested.
    pub local_addr: SocketAddr,
    pub bind_host: String,
    pub target: Target,
    pub plugin: String,
    /// Closed after its first connection.
    pub temporary: bool,
}

impl ListenerInfo {
    pub fn describe(&self) -> String {
        let mut line = format!("{} {} -> {} ({})", self.id, self.local_addr, self.target, self.plugin);

        if self.temporary {
            line.push_str(" [once]");
        }

        line
    }

    /// Whether this listener was requested as `host:port`.
    pub(crate) fn is_bound_to(&self, host: &str, port: u16) -> bool {
        self.local_addr.port() == port && (self.bind_host == host || self.local_addr.ip().to_string() == host)
    }
}

pub(crate) struct ListenerEntry {
    pub(crate) info: ListenerInfo,
    cancel: CancellationToken,
}

impl ListenerEntry {
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

pub(crate) struct ListenerTask {
    pub(crate) id: ListenerId,
    pub(crate) listener: TcpListener,
    pub(crate) temporary: bool,
    pub(crate) handle: TunnelHandle,
}

impl ListenerTask {
    pub(crate) fn spawn(self, info: ListenerInfo, parent_span: &Span) -> ListenerEntry {
        let cancel = CancellationToken::new();
        let span = info_span!(parent: parent_span.clone(), "listener", id = %info.id, addr = %info.local_addr);

        ChildTask(tokio::spawn(self.run(cancel.clone()).instrument(span))).detach();

        ListenerEntry { info, cancel }
    }

    async fn run(self, cancel: CancellationToken) {
        let Self {
            id,
            listener,
            temporary,
            handle,
        } = self;

        debug!("Start listener");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "Accepted connection");

                    if let Err(error) = handle.accepted(id, stream, peer_addr) {
                        debug!(error = format!("{error:#}"), "Couldn't hand over connection");
                        break;
                    }

                    if temporary {
                        break;
                    }
                }
                Err(error) if is_transient_accept_error(&error) => {
                    warn!(%error, "Couldn't accept next TCP stream, retrying");

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
                Err(error) => {
                    error!(%error, "Couldn't accept next TCP stream");
                    break;
                }
            }
        }

        debug!("Listener closed");

        handle.listener_closed(id);
    }
}

/// Failures tied to a single pending connection or to resource exhaustion, the listening
/// socket itself is still usable.
fn is_transient_accept_error(error: &io::Error) -> bool {
    // EMFILE, ENFILE, ENOMEM
    const RESOURCE_EXHAUSTION: [i32; 3] = [24, 23, 12];

    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => error
            .raw_os_error()
            .is_some_and(|code| cfg!(unix) && RESOURCE_EXHAUSTION.contains(&code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(temporary: bool) -> ListenerInfo {
        ListenerInfo {
            id: ListenerId::from(3),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 2121)),
            bind_host: "localhost".to_owned(),
            target: Target::new("ftp.example.com", 21),
            plugin: "ftp".to_owned(),
            temporary,
        }
    }

    #[test]
    fn description() {
        assert_eq!("L#3 127.0.0.1:2121 -> ftp.example.com:21 (ftp)", info(false).describe());
        assert_eq!("L#3 127.0.0.1:2121 -> ftp.example.com:21 (ftp) [once]", info(true).describe());
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));

        if cfg!(unix) {
            // EMFILE
            assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        }

        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn bound_address_matching() {
        let info = info(false);
        assert!(info.is_bound_to("localhost", 2121));
        assert!(info.is_bound_to("127.0.0.1", 2121));
        assert!(!info.is_bound_to("localhost", 21));
        assert!(!info.is_bound_to("0.0.0.0", 2121));
    }
}
