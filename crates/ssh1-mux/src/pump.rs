//! Tasks moving bytes between local sockets and the scheduler.

use bytes::Bytes;
use tokio::io::AsyncWriteExt as _;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Span};

use crate::channel::ChannelKey;
use crate::config::Target;
use crate::plugin::SharedFilter;
use crate::{is_really_an_error, ChildTask, DataReceiver, InternalMessage, InternalMessageSender};

pub(crate) struct DataReaderTask {
    pub(crate) reader: OwnedReadHalf,
    pub(crate) key: ChannelKey,
    pub(crate) chunk_size: usize,
    pub(crate) filter: Option<SharedFilter>,
    pub(crate) internal_msg_tx: InternalMessageSender,
    pub(crate) stop: CancellationToken,
}

impl DataReaderTask {
    pub(crate) fn spawn(self, span: Span) -> ChildTask<()> {
        ChildTask(tokio::spawn(self.run().instrument(span)))
    }

    async fn run(self) {
        use futures_util::StreamExt as _;

        let Self {
            reader,
            key,
            chunk_size,
            filter,
            internal_msg_tx,
            stop,
        } = self;

        let chunk_size = chunk_size.max(1);
        let mut bytes_stream = FramedRead::new(reader, tokio_util::codec::BytesCodec::new());

        trace!("Started forwarding");

        loop {
            let bytes = tokio::select! {
                _ = stop.cancelled() => {
                    trace!("Reader stopped");
                    break;
                }
                bytes = bytes_stream.next() => bytes,
            };

            let bytes = match bytes {
                Some(Ok(bytes)) => bytes.freeze(),
                Some(Err(error)) if is_really_an_error(&error) => {
                    warn!(%error, "Couldn't read next bytes from stream");
                    break;
                }
                Some(Err(error)) => {
                    debug!(%error, "Couldn't read next bytes from stream (not really an error)");
                    break;
                }
                None => break,
            };

            let mut bytes = match &filter {
                Some(filter) => filter.lock().to_peer(bytes),
                None => bytes,
            };

            while !bytes.is_empty() {
                let chunk = bytes.split_to(core::cmp::min(chunk_size, bytes.len()));

                if internal_msg_tx.send(InternalMessage::Data { key, data: chunk }).await.is_err() {
                    return;
                }
            }
        }

        trace!("Finished forwarding (EOF)");

        // The scheduler is usually gone already when the whole session is closing.
        let _ = internal_msg_tx.send(InternalMessage::ReadEof { key }).await;
    }
}

pub(crate) struct DataWriterTask {
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) data_rx: DataReceiver,
    pub(crate) key: ChannelKey,
    pub(crate) filter: Option<SharedFilter>,
    pub(crate) internal_msg_tx: InternalMessageSender,
    pub(crate) stop: CancellationToken,
}

impl DataWriterTask {
    pub(crate) fn spawn(self, span: Span) -> ChildTask<()> {
        ChildTask(tokio::spawn(self.run().instrument(span)))
    }

    async fn run(self) {
        let Self {
            mut writer,
            mut data_rx,
            key,
            filter,
            internal_msg_tx,
            stop,
        } = self;

        loop {
            let data = tokio::select! {
                _ = stop.cancelled() => return,
                data = data_rx.recv() => data,
            };

            let Some(data) = data else {
                // Peer sent its INPUT_EOF and everything queued before it was written.
                if let Err(error) = writer.shutdown().await {
                    debug!(%error, "Couldn't shut down write half");
                }
                break;
            };

            let data: Bytes = match &filter {
                Some(filter) => filter.lock().to_local(data),
                None => data,
            };

            if let Err(error) = writer.write_all(&data).await {
                if is_really_an_error(&error) {
                    warn!(%error, "Writer task failed");
                } else {
                    debug!(%error, "Writer task failed (not really an error)");
                }
                break;
            }
        }

        trace!("Write half closed");

        let _ = internal_msg_tx.send(InternalMessage::WriteClosed { key }).await;
    }
}

pub(crate) struct StreamResolverTask {
    pub(crate) key: ChannelKey,
    pub(crate) target: Target,
    pub(crate) internal_msg_tx: InternalMessageSender,
}

impl StreamResolverTask {
    pub(crate) fn spawn(self, span: Span) -> ChildTask<()> {
        ChildTask(tokio::spawn(self.run().instrument(span)))
    }

    async fn run(self) {
        let Self {
            key,
            target,
            internal_msg_tx,
        } = self;

        let message = match connect(&target).await {
            Ok(stream) => InternalMessage::StreamResolved { key, stream },
            Err(error) => {
                debug!(error = format!("{error:#}"), %target, "Couldn't connect to target");
                InternalMessage::ResolveFailed { key }
            }
        };

        let _ = internal_msg_tx.send(message).await;
    }
}

async fn connect(target: &Target) -> anyhow::Result<TcpStream> {
    use anyhow::Context as _;

    let socket_addrs = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .with_context(|| format!("couldn't resolve {target}"))?;

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
        Some(error) => Err(anyhow::Error::new(error).context(format!("couldn't open TCP stream to {target}"))),
        None => anyhow::bail!("no addresses resolved for {target}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use std::sync::Arc;

    use parking_lot::Mutex;
    use ssh1_proto::LocalChannelId;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::plugin::PayloadFilter;

    const TEST_TIMEOUT: core::time::Duration = core::time::Duration::from_secs(5);

    fn key() -> ChannelKey {
        ChannelKey {
            id: LocalChannelId::from(4),
            serial: 9,
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    struct Reverse;

    impl PayloadFilter for Reverse {
        fn to_local(&mut self, data: Bytes) -> Bytes {
            data.iter().rev().copied().collect::<Vec<u8>>().into()
        }
    }

    #[tokio::test]
    async fn reader_chunks_and_reports_eof() {
        let (mut local, remote) = socket_pair().await;
        let (reader, _writer) = remote.into_split();
        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);

        let _task = DataReaderTask {
            reader,
            key: key(),
            chunk_size: 4,
            filter: None,
            internal_msg_tx,
            stop: CancellationToken::new(),
        }
        .spawn(Span::none());

        local.write_all(b"0123456789").await.unwrap();
        local.shutdown().await.unwrap();

        let mut received = Vec::new();

        loop {
            let msg = tokio::time::timeout(TEST_TIMEOUT, internal_msg_rx.recv())
                .await
                .unwrap()
                .unwrap();

            match msg {
                InternalMessage::Data { key: k, data } => {
                    assert_eq!(key(), k);
                    assert!(data.len() <= 4);
                    received.extend_from_slice(&data);
                }
                InternalMessage::ReadEof { key: k } => {
                    assert_eq!(key(), k);
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        assert_eq!(b"0123456789".as_slice(), received.as_slice());
    }

    #[tokio::test]
    async fn zero_chunk_size_still_forwards() {
        let (mut local, remote) = socket_pair().await;
        let (reader, _writer) = remote.into_split();
        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);

        let _task = DataReaderTask {
            reader,
            key: key(),
            chunk_size: 0,
            filter: None,
            internal_msg_tx,
            stop: CancellationToken::new(),
        }
        .spawn(Span::none());

        local.write_all(b"abc").await.unwrap();
        local.shutdown().await.unwrap();

        let mut received = Vec::new();

        loop {
            let msg = tokio::time::timeout(TEST_TIMEOUT, internal_msg_rx.recv())
                .await
                .unwrap()
                .unwrap();

            match msg {
                InternalMessage::Data { data, .. } => {
                    assert_eq!(1, data.len());
                    received.extend_from_slice(&data);
                }
                InternalMessage::ReadEof { .. } => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }

        assert_eq!(b"abc".as_slice(), received.as_slice());
    }

    #[tokio::test]
    async fn stopped_reader_reports_eof() {
        let (_local, remote) = socket_pair().await;
        let (reader, _writer) = remote.into_split();
        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);
        let stop = CancellationToken::new();

        let _task = DataReaderTask {
            reader,
            key: key(),
            chunk_size: 1024,
            filter: None,
            internal_msg_tx,
            stop: stop.clone(),
        }
        .spawn(Span::none());

        stop.cancel();

        let msg = tokio::time::timeout(TEST_TIMEOUT, internal_msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, InternalMessage::ReadEof { .. }));
    }

    #[tokio::test]
    async fn writer_drains_then_closes() {
        let (mut local, remote) = socket_pair().await;
        let (_reader, writer) = remote.into_split();
        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let _task = DataWriterTask {
            writer,
            data_rx,
            key: key(),
            filter: Some(Arc::new(Mutex::new(Box::new(Reverse) as Box<dyn PayloadFilter>))),
            internal_msg_tx,
            stop: CancellationToken::new(),
        }
        .spawn(Span::none());

        data_tx.send(Bytes::from_static(b"cba")).unwrap();
        data_tx.send(Bytes::from_static(b"fed")).unwrap();
        drop(data_tx);

        let mut received = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, local.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b"abcdef".as_slice(), received.as_slice());

        let msg = tokio::time::timeout(TEST_TIMEOUT, internal_msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, InternalMessage::WriteClosed { key: k } if k == key()));
    }

    #[tokio::test]
    async fn resolver_reports_refused_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);

        let _task = StreamResolverTask {
            key: key(),
            target: Target::new("127.0.0.1", port),
            internal_msg_tx,
        }
        .spawn(Span::none());

        let msg = tokio::time::timeout(TEST_TIMEOUT, internal_msg_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, InternalMessage::ResolveFailed { key: k } if k == key()));
    }

    #[tokio::test]
    async fn resolver_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (internal_msg_tx, mut internal_msg_rx) = mpsc::channel(16);

        let _task = StreamResolverTask {
            key: key(),
            target: Target::new("127.0.0.1", port),
            internal_msg_tx,
        }
        .spawn(Span::none());

        let (msg, accepted) = tokio::join!(internal_msg_rx.recv(), listener.accept());
        accepted.unwrap();
        assert!(matches!(msg, Some(InternalMessage::StreamResolved { .. })));
    }
}
