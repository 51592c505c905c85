//! Byte stream carrying the SSH1 packets.
//!
//! The stream is expected to be past the key exchange and user authentication, without
//! encryption or compression.

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

pub type ErasedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type ErasedWrite = Box<dyn AsyncWrite + Send + Unpin>;

const SCHEME_SEPARATOR: &str = "://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// Connect to the peer.
    Tcp { addr: String },
    /// Wait for the peer to connect.
    TcpListen { bind_addr: String },
}

impl TransportMode {
    pub fn parse_str(arg: &str) -> anyhow::Result<Self> {
        let (scheme, value) = arg
            .split_once(SCHEME_SEPARATOR)
            .context("invalid format: missing scheme (e.g.: tcp://<ADDRESS>)")?;

        anyhow::ensure!(!value.is_empty(), "address is missing");

        match scheme {
            "tcp" => Ok(Self::Tcp { addr: value.to_owned() }),
            "tcp-listen" => Ok(Self::TcpListen {
                bind_addr: value.to_owned(),
            }),
            _ => anyhow::bail!("unknown transport scheme: {scheme}"),
        }
    }
}

pub(crate) async fn open(mode: &TransportMode) -> anyhow::Result<(ErasedRead, ErasedWrite)> {
    let stream = match mode {
        TransportMode::Tcp { addr } => {
            info!(%addr, "Connecting");

            tcp_connect(addr).await?
        }
        TransportMode::TcpListen { bind_addr } => {
            info!(%bind_addr, "Listening for peer");

            let listener = TcpListener::bind(bind_addr.as_str())
                .await
                .with_context(|| format!("couldn't bind listener to {bind_addr}"))?;

            let (stream, peer_addr) = listener.accept().await.context("accept operation failed")?;

            info!(%peer_addr, "Peer connected");

            stream
        }
    };

    stream.set_nodelay(true).context("couldn't set TCP_NODELAY")?;

    let (read, write) = stream.into_split();

    Ok((Box::new(read), Box::new(write)))
}

async fn tcp_connect(addr: &str) -> anyhow::Result<TcpStream> {
    let socket_addrs = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("couldn't resolve {addr}"))?;

    let mut last_error = None;

    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(%error, %socket_addr, "TcpStream::connect failed");
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(error) => Err(anyhow::Error::new(error).context(format!("couldn't connect to {addr}"))),
        None => anyhow::bail!("no address resolved for {addr}"),
    }
}
