// Used by the sshtun binary.
use {dirs_next as _, humantime as _, seahorse as _, tracing_appender as _, tracing_subscriber as _};

#[macro_use]
extern crate tracing;

pub mod forward;
pub mod transport;

mod session;
mod utils;

use core::time::Duration;

use anyhow::Context as _;
use ssh1_mux::{FtpConfig, Target, TunnelConfig, TunnelController};
use tokio::sync::mpsc;
use tracing::Instrument as _;

use self::forward::ForwardSpec;
use self::transport::TransportMode;

#[derive(Debug)]
pub struct ConnectCfg {
    pub transport_mode: TransportMode,
    pub forwards: Vec<ForwardSpec>,
    pub x11_target: Option<Target>,
    pub ftp: FtpConfig,
    pub transport_timeout: Option<Duration>,
}

impl ConnectCfg {
    fn tunnel_config(&self) -> TunnelConfig {
        let mut tunnel_cfg = TunnelConfig::new().with_ftp(self.ftp.clone());

        for forward in &self.forwards {
            tunnel_cfg = match forward {
                ForwardSpec::Local(forward) => tunnel_cfg.with_local_forward(forward.clone()),
                ForwardSpec::Remote(forward) => tunnel_cfg.with_remote_forward(forward.clone()),
            };
        }

        if let Some(x11_target) = &self.x11_target {
            tunnel_cfg = tunnel_cfg.with_x11_target(x11_target.clone());
        }

        tunnel_cfg
    }
}

/// Runs the session and the configured forwards until the peer is done.
///
/// Returns the exit status of the remote command, 0 when the peer closed the session without one.
#[instrument("connect", skip_all)]
pub async fn connect(cfg: ConnectCfg) -> anyhow::Result<u32> {
    info!("Start SSH1 tunnel");
    debug!(?cfg);

    let tunnel_cfg = cfg.tunnel_config();

    let (reader, writer) = utils::timeout(cfg.transport_timeout, transport::open(&cfg.transport_mode))
        .instrument(info_span!("open_transport"))
        .await
        .context("couldn't open transport")?;

    let (session_event_tx, session_event_rx) = mpsc::unbounded_channel();

    let controller = TunnelController::new(reader, writer)
        .with_config(tunnel_cfg)
        .with_session_events(session_event_tx);

    let stdin_task = tokio::spawn(session::forward_stdin(controller.handle()).instrument(info_span!("stdin")));

    let (controller_result, outcome) = tokio::join!(controller.run(), session::write_output(session_event_rx));

    stdin_task.abort();

    controller_result.context("tunnel failed")?;

    let outcome = outcome.context("couldn't write session output")?;

    if let Some(reason) = &outcome.disconnect_reason {
        info!(reason, "Peer disconnected");
    }

    Ok(outcome.exit_status.unwrap_or(0))
}
