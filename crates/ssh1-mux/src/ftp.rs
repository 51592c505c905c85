//! FTP control connection rewriting.
//!
//! Data connections of a tunneled FTP session must go through the tunnel as well. In passive
//! mode the server reply is rewritten to point at a one-shot local listener; in active mode the
//! client `PORT` command is rewritten to point at a remote forward, and a temporary host mapping
//! brings the resulting peer-initiated channel back to the client.

use std::net::{IpAddr, Ipv4Addr};

use bytes::{Bytes, BytesMut};

use crate::api::TunnelHandle;
use crate::config::{ActiveProxy, Target};
use crate::plugin::{bind_listener, PayloadFilter, PluginContext, ProtocolPlugin, FTP_PLUGIN};
use crate::TunnelError;

#[derive(Debug, Default)]
pub(crate) struct FtpPlugin;

impl ProtocolPlugin for FtpPlugin {
    fn name(&self) -> &str {
        FTP_PLUGIN
    }

    fn new_filter(&self, ctx: &PluginContext) -> Option<Box<dyn PayloadFilter>> {
        Some(Box::new(FtpFilter::new(ctx)))
    }
}

/// Longest partial reply line held back while waiting for the rest of a 227 reply.
const MAX_PENDING_REPLY_SIZE: usize = 512;

pub(crate) struct FtpFilter {
    handle: TunnelHandle,
    local_ip: IpAddr,
    active_proxy: Option<ActiveProxy>,
    waiting_pasv_response: bool,
    /// Start of a reply line split across several DATA messages.
    pending_reply: BytesMut,
}

impl FtpFilter {
    pub(crate) fn new(ctx: &PluginContext) -> Self {
        Self {
            handle: ctx.handle.clone(),
            local_ip: ctx.local_ip,
            active_proxy: ctx.ftp.active_proxy.clone(),
            waiting_pasv_response: false,
            pending_reply: BytesMut::new(),
        }
    }

    fn rewrite_port_command(&self, arguments: &str) -> Result<Option<String>, TunnelError> {
        let Some(proxy) = &self.active_proxy else {
            trace!("No active-mode proxy, PORT command left untouched");
            return Ok(None);
        };

        let (ip, port) = parse_host_port(arguments)?;

        self.handle
            .add_host_map_temporary(proxy.forward_host.clone(), ip.to_string(), port)
            .map_err(|e| TunnelError::malformed_payload(format!("{e:#}")))?;

        debug!(client = %format_args!("{ip}:{port}"), proxy = %proxy.advertised, "Rewrote PORT command");

        Ok(Some(format!(
            "PORT {}",
            format_host_port(*proxy.advertised.ip(), proxy.advertised.port())
        )))
    }

    fn rewrite_pasv_reply(&self, line: &str) -> Result<String, TunnelError> {
        let (open, close) = line
            .find('(')
            .zip(line.rfind(')'))
            .filter(|(open, close)| open < close)
            .ok_or_else(|| TunnelError::malformed_payload("227 reply without address"))?;

        let (ip, port) = parse_host_port(&line[open + 1..close])?;

        let IpAddr::V4(local_ip) = self.local_ip else {
            return Err(TunnelError::malformed_payload("local address is not IPv4"));
        };

        let listener = bind_listener(&local_ip.to_string(), 0)?;
        let local_port = listener.local_addr()?.port();

        self.handle
            .adopt_listener(listener, Target::new(ip.to_string(), port), true)
            .map_err(|e| TunnelError::malformed_payload(format!("{e:#}")))?;

        debug!(server = %format_args!("{ip}:{port}"), local_port, "Rewrote passive mode reply");

        Ok(format!(
            "{}({}){}",
            &line[..open],
            format_host_port(local_ip, local_port),
            &line[close + 1..]
        ))
    }
}

impl PayloadFilter for FtpFilter {
    fn to_peer(&mut self, data: Bytes) -> Bytes {
        let Ok(text) = core::str::from_utf8(&data) else {
            return data;
        };

        let mut rewritten = String::with_capacity(text.len());
        let mut changed = false;

        for line in text.split_inclusive('\n') {
            let (content, ending) = split_line_ending(line);
            let (command, arguments) = content.split_once(' ').unwrap_or((content, ""));

            if command.eq_ignore_ascii_case("PASV") {
                self.waiting_pasv_response = true;
            } else if command.eq_ignore_ascii_case("PORT") {
                match self.rewrite_port_command(arguments) {
                    Ok(Some(new_content)) => {
                        rewritten.push_str(&new_content);
                        rewritten.push_str(ending);
                        changed = true;
                        continue;
                    }
                    Ok(None) => {}
                    Err(error) => warn!(%error, "Couldn't rewrite PORT command"),
                }
            }

            rewritten.push_str(line);
        }

        if changed {
            Bytes::from(rewritten)
        } else {
            data
        }
    }

    fn to_local(&mut self, data: Bytes) -> Bytes {
        if !self.waiting_pasv_response && self.pending_reply.is_empty() {
            return data;
        }

        let data = if self.pending_reply.is_empty() {
            data
        } else {
            let mut joined = core::mem::take(&mut self.pending_reply);
            joined.extend_from_slice(&data);
            joined.freeze()
        };

        let Ok(text) = core::str::from_utf8(&data) else {
            return data;
        };

        let mut rewritten = String::with_capacity(text.len());
        let mut changed = false;

        for line in text.split_inclusive('\n') {
            let complete = line.ends_with('\n');

            if self.waiting_pasv_response
                && !complete
                && line.len() < MAX_PENDING_REPLY_SIZE
                && (line.starts_with("227") || "227".starts_with(line))
            {
                trace!(len = line.len(), "Holding back partial reply line");
                self.pending_reply.extend_from_slice(line.as_bytes());
                changed = true;
                continue;
            }

            if self.waiting_pasv_response && complete && line.starts_with("227") {
                self.waiting_pasv_response = false;

                let (content, ending) = split_line_ending(line);

                match self.rewrite_pasv_reply(content) {
                    Ok(new_content) => {
                        rewritten.push_str(&new_content);
                        rewritten.push_str(ending);
                        changed = true;
                        continue;
                    }
                    Err(error) => warn!(%error, "Couldn't rewrite passive mode reply"),
                }
            }

            rewritten.push_str(line);
        }

        if changed {
            Bytes::from(rewritten)
        } else {
            data
        }
    }
}

fn split_line_ending(line: &str) -> (&str, &str) {
    let content = line.trim_end_matches(['\r', '\n']);
    (content, &line[content.len()..])
}

/// Parses `h1,h2,h3,h4,p1,p2`.
fn parse_host_port(value: &str) -> Result<(Ipv4Addr, u16), TunnelError> {
    let fields: Vec<&str> = value.trim().split(',').map(str::trim).collect();

    if fields.len() != 6 {
        return Err(TunnelError::malformed_payload(format!(
            "expected 6 address fields, got {}",
            fields.len()
        )));
    }

    let mut octets = [0u8; 6];

    for (octet, field) in octets.iter_mut().zip(&fields) {
        *octet = field
            .parse()
            .map_err(|_| TunnelError::malformed_payload(format!("invalid address field `{field}`")))?;
    }

    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
    let port = u16::from_be_bytes([octets[4], octets[5]]);

    Ok((ip, port))
}

fn format_host_port(ip: Ipv4Addr, port: u16) -> String {
    let [a, b, c, d] = ip.octets();
    let [hi, lo] = port.to_be_bytes();
    format!("{a},{b},{c},{d},{hi},{lo}")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use std::net::SocketAddrV4;

    use tokio::sync::mpsc;

    use super::*;
    use crate::api::ControllerRequest;
    use crate::config::FtpConfig;

    fn filter(ftp: FtpConfig) -> (FtpFilter, mpsc::UnboundedReceiver<ControllerRequest>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let ctx = PluginContext {
            handle: TunnelHandle::new(request_tx),
            local_ip: IpAddr::from([127, 0, 0, 1]),
            ftp,
        };
        (FtpFilter::new(&ctx), request_rx)
    }

    fn text(bytes: &Bytes) -> &str {
        core::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn parse_address() {
        assert_eq!(
            (Ipv4Addr::new(10, 0, 0, 5), 51203),
            parse_host_port("10,0,0,5,200,3").unwrap()
        );
        assert_eq!(
            (Ipv4Addr::new(192, 168, 1, 2), 21),
            parse_host_port(" 192, 168, 1, 2, 0, 21 ").unwrap()
        );
    }

    #[test]
    fn parse_malformed_address() {
        for value in ["10,0,0,5,200", "10,0,0,5,200,3,1", "10,0,0,256,200,3", "10,0,0,x,200,3", ""] {
            let error = parse_host_port(value).unwrap_err();
            assert!(matches!(error, TunnelError::MalformedPayload { .. }), "{value}");
        }
    }

    #[test]
    fn pasv_reply_is_rewritten() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        let command = filter.to_peer(Bytes::from_static(b"PASV\r\n"));
        assert_eq!("PASV\r\n", text(&command));

        let reply = filter.to_local(Bytes::from_static(b"227 Entering Passive Mode (10,0,0,5,200,3)\r\n"));

        let Ok(ControllerRequest::AdoptListener {
            listener,
            target,
            temporary,
        }) = request_rx.try_recv()
        else {
            panic!("expected a listener to adopt");
        };

        assert_eq!(Target::new("10.0.0.5", 51203), target);
        assert!(temporary);

        let local_port = listener.local_addr().unwrap().port();
        assert_eq!(
            format!(
                "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                local_port >> 8,
                local_port & 0xFF
            ),
            text(&reply)
        );

        // Only the first 227 reply following PASV is rewritten.
        let reply = filter.to_local(Bytes::from_static(b"227 Entering Passive Mode (10,0,0,5,200,3)\r\n"));
        assert_eq!("227 Entering Passive Mode (10,0,0,5,200,3)\r\n", text(&reply));
    }

    #[test]
    fn split_pasv_reply_is_rewritten() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        filter.to_peer(Bytes::from_static(b"PASV\r\n"));

        let head = filter.to_local(Bytes::from_static(b"200 Ok\r\n227 Entering Pass"));
        assert_eq!("200 Ok\r\n", text(&head));
        assert!(request_rx.try_recv().is_err());

        let middle = filter.to_local(Bytes::from_static(b"ive Mode (10,0,0,5,"));
        assert!(middle.is_empty());

        let tail = filter.to_local(Bytes::from_static(b"200,3)\r\n150 Next\r\n"));

        let Ok(ControllerRequest::AdoptListener { listener, target, .. }) = request_rx.try_recv() else {
            panic!("expected a listener to adopt");
        };
        assert_eq!(Target::new("10.0.0.5", 51203), target);

        let local_port = listener.local_addr().unwrap().port();
        assert_eq!(
            format!(
                "227 Entering Passive Mode (127,0,0,1,{},{})\r\n150 Next\r\n",
                local_port >> 8,
                local_port & 0xFF
            ),
            text(&tail)
        );

        // Nothing is held back once the reply went through.
        let after = filter.to_local(Bytes::from_static(b"227 Entering"));
        assert_eq!("227 Entering", text(&after));
    }

    #[test]
    fn reply_split_before_the_code_is_rewritten() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        filter.to_peer(Bytes::from_static(b"PASV\r\n"));

        assert!(filter.to_local(Bytes::from_static(b"2")).is_empty());
        let reply = filter.to_local(Bytes::from_static(b"27 Entering Passive Mode (10,0,0,5,200,3)\r\n"));

        assert!(text(&reply).starts_with("227 Entering Passive Mode (127,0,0,1,"));
        assert!(matches!(request_rx.try_recv(), Ok(ControllerRequest::AdoptListener { .. })));
    }

    #[test]
    fn unsolicited_227_is_left_alone() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        let reply = filter.to_local(Bytes::from_static(b"227 Entering Passive Mode (10,0,0,5,200,3)\r\n"));
        assert_eq!("227 Entering Passive Mode (10,0,0,5,200,3)\r\n", text(&reply));
        assert!(request_rx.try_recv().is_err());
    }

    #[test]
    fn malformed_pasv_reply_passes_through() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        filter.to_peer(Bytes::from_static(b"pasv\r\n"));
        let reply = filter.to_local(Bytes::from_static(b"227 Entering Passive Mode (10,0,0,300,200,3)\r\n"));

        assert_eq!("227 Entering Passive Mode (10,0,0,300,200,3)\r\n", text(&reply));
        assert!(request_rx.try_recv().is_err());
        assert!(!filter.waiting_pasv_response);
    }

    #[test]
    fn port_command_is_rewritten() {
        let (mut filter, mut request_rx) = filter(FtpConfig {
            active_proxy: Some(ActiveProxy {
                advertised: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2121),
                forward_host: "ftp-data".to_owned(),
            }),
        });

        let command = filter.to_peer(Bytes::from_static(b"TYPE I\r\nPORT 192,168,1,20,19,137\r\n"));
        assert_eq!("TYPE I\r\nPORT 10,0,0,1,8,73\r\n", text(&command));

        assert!(matches!(request_rx.try_recv(), Ok(ControllerRequest::AddHostMap { .. })));
    }

    #[test]
    fn port_command_registers_temporary_mapping() {
        let (mut filter, mut request_rx) = filter(FtpConfig {
            active_proxy: Some(ActiveProxy {
                advertised: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2121),
                forward_host: "ftp-data".to_owned(),
            }),
        });

        filter.to_peer(Bytes::from_static(b"PORT 192,168,1,20,19,137\r\n"));

        match request_rx.try_recv().unwrap() {
            ControllerRequest::AddHostMap {
                from_host,
                to_host,
                to_port,
                temporary,
            } => {
                assert_eq!("ftp-data", from_host);
                assert_eq!("192.168.1.20", to_host);
                assert_eq!(5001, to_port);
                assert!(temporary);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn port_command_without_proxy_is_left_alone() {
        let (mut filter, mut request_rx) = filter(FtpConfig::default());

        let command = filter.to_peer(Bytes::from_static(b"PORT 192,168,1,20,19,137\r\n"));
        assert_eq!("PORT 192,168,1,20,19,137\r\n", text(&command));
        assert!(request_rx.try_recv().is_err());
    }

    #[test]
    fn binary_payload_is_untouched() {
        let (mut filter, _request_rx) = filter(FtpConfig::default());
        filter.waiting_pasv_response = true;

        let payload = Bytes::from_static(&[0xFF, 0xFE, 0x00, 0x32]);
        assert_eq!(payload, filter.to_local(payload.clone()));
        assert_eq!(payload, filter.to_peer(payload.clone()));
    }
}
