//! Interactive session plumbing: standard input goes to the remote command, its output comes back.

use bytes::BytesMut;
use ssh1_mux::{SessionEvent, TunnelHandle};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;

const STDIN_CHUNK_SIZE: usize = 4 * 1024;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SessionOutcome {
    pub(crate) exit_status: Option<u32>,
    pub(crate) disconnect_reason: Option<String>,
}

pub(crate) async fn forward_stdin(handle: TunnelHandle) {
    forward_input(tokio::io::stdin(), handle).await;
}

async fn forward_input<R: AsyncRead + Unpin>(mut input: R, handle: TunnelHandle) {
    let mut buf = BytesMut::with_capacity(STDIN_CHUNK_SIZE);

    loop {
        buf.reserve(STDIN_CHUNK_SIZE);

        match input.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if handle.send_stdin(buf.split().freeze()).is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "Couldn't read standard input");
                break;
            }
        }
    }

    debug!("End of input");

    let _ = handle.send_stdin_eof();
}

pub(crate) async fn write_output(session_event_rx: mpsc::UnboundedReceiver<SessionEvent>) -> anyhow::Result<SessionOutcome> {
    write_session_events(session_event_rx, tokio::io::stdout(), tokio::io::stderr()).await
}

async fn write_session_events<O, E>(
    mut session_event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mut stdout: O,
    mut stderr: E,
) -> anyhow::Result<SessionOutcome>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut outcome = SessionOutcome::default();

    while let Some(event) = session_event_rx.recv().await {
        match event {
            SessionEvent::Stdout(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            SessionEvent::Stderr(data) => {
                stderr.write_all(&data).await?;
                stderr.flush().await?;
            }
            SessionEvent::ExitStatus(status) => {
                info!(status, "Remote command exited");
                outcome.exit_status = Some(status);
            }
            SessionEvent::Disconnected(reason) => {
                outcome.disconnect_reason = Some(reason);
            }
        }
    }

    Ok(outcome)
}
