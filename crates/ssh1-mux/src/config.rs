use std::net::SocketAddrV4;

use anyhow::Context as _;

use crate::plugin::GENERAL_PLUGIN;

/// Payload bytes carried by a single `MSG_CHANNEL_DATA`.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8 * 1024; // 8 kiB

/// Upper bound for `max_chunk_size`, leaves room for the DATA header and compression overhead
/// below the maximum packet size.
pub const MAXIMUM_CHUNK_SIZE: usize = 128 * 1024; // 128 kiB

/// Tunnel controller configuration.
///
/// Defaults are conservative: no forward, no X11, and peer-initiated opens are only accepted
/// for targets we explicitly asked the peer to forward.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Listeners created when the controller starts.
    pub local_forwards: Vec<LocalForward>,
    /// Port forward requests sent when the controller starts.
    pub remote_forwards: Vec<RemoteForward>,
    /// Local X11 display server. X11 opens are refused when unset.
    pub x11_target: Option<Target>,
    pub ftp: FtpConfig,
    /// Additional targets the peer may open channels to.
    pub filtering: FilteringRule,
    /// Clamped between 1 and [`MAXIMUM_CHUNK_SIZE`] when used.
    pub max_chunk_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
            x11_target: None,
            ftp: FtpConfig::default(),
            filtering: FilteringRule::Deny,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_local_forward(mut self, forward: LocalForward) -> Self {
        self.local_forwards.push(forward);
        self
    }

    #[must_use]
    pub fn with_remote_forward(mut self, forward: RemoteForward) -> Self {
        self.remote_forwards.push(forward);
        self
    }

    #[must_use]
    pub fn with_x11_target(mut self, target: Target) -> Self {
        self.x11_target = Some(target);
        self
    }

    #[must_use]
    pub fn with_ftp(mut self, ftp: FtpConfig) -> Self {
        self.ftp = ftp;
        self
    }

    #[must_use]
    pub fn with_filtering(mut self, filtering: FilteringRule) -> Self {
        self.filtering = filtering;
        self
    }

    #[must_use]
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size.clamp(1, MAXIMUM_CHUNK_SIZE);
        self
    }

    /// Payload bytes actually put in a single DATA message.
    pub fn chunk_size(&self) -> usize {
        self.max_chunk_size.clamp(1, MAXIMUM_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parses `host:port`, IPv6 hosts between brackets.
    pub fn parse_str(value: &str) -> anyhow::Result<Self> {
        let (host, port) = value.rsplit_once(':').context("missing port")?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        anyhow::ensure!(!host.is_empty(), "empty host");
        let port = port.parse().context("invalid port value")?;
        Ok(Self::new(host, port))
    }
}

impl core::fmt::Display for Target {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Listen locally and tunnel accepted connections to `target` through the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    pub bind_host: String,
    pub bind_port: u16,
    pub target: Target,
    pub plugin: String,
}

impl LocalForward {
    pub fn new(bind_host: impl Into<String>, bind_port: u16, target: Target) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            target,
            plugin: GENERAL_PLUGIN.to_owned(),
        }
    }

    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }
}

/// Ask the peer to listen on `server_port` and open channels back to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    pub server_port: u16,
    pub target: Target,
    pub plugin: String,
}

impl RemoteForward {
    pub fn new(server_port: u16, target: Target) -> Self {
        Self {
            server_port,
            target,
            plugin: GENERAL_PLUGIN.to_owned(),
        }
    }

    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FtpConfig {
    /// Address advertised in rewritten `PORT` commands. Active mode is left alone when unset.
    pub active_proxy: Option<ActiveProxy>,
}

/// Server-side end of a remote forward dedicated to active-mode FTP data connections.
///
/// The peer listens on `advertised` and opens channels to `forward_host`, which the host
/// map then redirects to the address found in the client's `PORT` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProxy {
    pub advertised: SocketAddrV4,
    pub forward_host: String,
}

/// Filtering rule for peer-initiated channels.
///
/// ```
/// use ssh1_mux::FilteringRule;
///
/// let rule = FilteringRule::port(80)
///     .and(FilteringRule::host("intranet").or(FilteringRule::wildcard_host("*.corp.local")))
///     .or(FilteringRule::host_and_port("127.0.0.1", 6000));
///
/// assert!(rule.is_allowed("intranet", 80));
/// assert!(rule.is_allowed("wiki.corp.local", 80));
/// assert!(rule.is_allowed("127.0.0.1", 6000));
/// assert!(!rule.is_allowed("wiki.corp.local", 22));
/// assert!(!rule.is_allowed("wiki.evil.local", 80));
/// assert!(!rule.is_allowed("127.0.0.1", 6001));
/// ```
#[derive(Debug, Clone, Default)]
pub enum FilteringRule {
    /// Always denied.
    #[default]
    Deny,
    /// Always allowed.
    Allow,
    /// Invert the rule
    Not(Box<FilteringRule>),
    /// Must fulfill every rule.
    All(Vec<FilteringRule>),
    /// Must fulfill at least one rule.
    Any(Vec<FilteringRule>),
    /// Host must match exactly.
    Host(String),
    /// Port must match exactly.
    Port(u16),
    /// Host and port must match exactly.
    HostAndPort { host: String, port: u16 },
    /// Rule matching multiple sub-domains, as in wildcard certificates.
    WildcardHost(String),
}

impl FilteringRule {
    /// Puts current rule behind a NOT operator
    #[must_use]
    pub fn invert(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn host(host: impl Into<String>) -> Self {
        Self::Host(host.into())
    }

    pub fn port(port: u16) -> Self {
        Self::Port(port)
    }

    pub fn host_and_port(host: impl Into<String>, port: u16) -> Self {
        Self::HostAndPort {
            host: host.into(),
            port,
        }
    }

    pub fn wildcard_host(host: impl Into<String>) -> Self {
        Self::WildcardHost(host.into())
    }

    /// Combine current rule using an "AND" operator
    #[must_use]
    pub fn and(self, rule: Self) -> Self {
        match self {
            Self::Allow => rule,
            Self::All(mut sub_rules) => {
                sub_rules.push(rule);
                Self::All(sub_rules)
            }
            current_rule => Self::All(vec![current_rule, rule]),
        }
    }

    /// Combine current rule using an "OR" operator
    #[must_use]
    pub fn or(self, rule: Self) -> Self {
        match self {
            Self::Deny => rule,
            Self::Any(mut sub_rules) => {
                sub_rules.push(rule);
                Self::Any(sub_rules)
            }
            current_rule => Self::Any(vec![current_rule, rule]),
        }
    }

    pub fn is_allowed(&self, target_host: &str, target_port: u16) -> bool {
        match self {
            FilteringRule::Deny => false,
            FilteringRule::Allow => true,
            FilteringRule::Not(rule) => !rule.is_allowed(target_host, target_port),
            FilteringRule::All(rules) => rules.iter().all(|r| r.is_allowed(target_host, target_port)),
            FilteringRule::Any(rules) => rules.iter().any(|r| r.is_allowed(target_host, target_port)),
            FilteringRule::Host(host) => target_host == host,
            FilteringRule::Port(port) => target_port == *port,
            FilteringRule::HostAndPort { host, port } => target_host == host && target_port == *port,
            FilteringRule::WildcardHost(host) => {
                let mut expected_it = host.rsplit('.');
                let mut actual_it = target_host.rsplit('.');
                loop {
                    match (expected_it.next(), actual_it.next()) {
                        (Some(expected), Some(actual)) if expected == actual => {}
                        (Some("*"), Some(_)) => {}
                        (None, None) => return true,
                        _ => return false,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn parse_target() {
        assert_eq!(Target::new("127.0.0.1", 80), Target::parse_str("127.0.0.1:80").unwrap());
        assert_eq!(Target::new("::1", 22), Target::parse_str("[::1]:22").unwrap());
        assert_eq!("[::1]:22", Target::new("::1", 22).to_string());
        assert!(Target::parse_str("localhost").is_err());
        assert!(Target::parse_str(":80").is_err());
        assert!(Target::parse_str("localhost:http").is_err());
    }

    #[test]
    fn deny_by_default() {
        let config = TunnelConfig::default();
        assert!(!config.filtering.is_allowed("127.0.0.1", 80));
        assert_eq!(DEFAULT_MAX_CHUNK_SIZE, config.max_chunk_size);
    }

    #[test]
    fn chunk_size_is_clamped() {
        assert_eq!(1, TunnelConfig::new().with_max_chunk_size(0).chunk_size());
        assert_eq!(
            MAXIMUM_CHUNK_SIZE,
            TunnelConfig::new().with_max_chunk_size(usize::MAX).chunk_size()
        );
        assert_eq!(512, TunnelConfig::new().with_max_chunk_size(512).chunk_size());

        let config = TunnelConfig {
            max_chunk_size: 0,
            ..TunnelConfig::default()
        };
        assert_eq!(1, config.chunk_size());
    }

    #[test]
    fn largest_chunk_fits_in_a_packet() {
        use tokio_util::codec::Encoder as _;

        let mut buf = bytes::BytesMut::new();
        let message = ssh1_proto::Message::data(
            ssh1_proto::RemoteChannelId::from(u32::MAX),
            bytes::Bytes::from(vec![0xAB; MAXIMUM_CHUNK_SIZE]),
        );

        crate::PacketCodec::new(crate::TransportCapabilities::default())
            .encode(message, &mut buf)
            .unwrap();
    }

    #[test]
    fn inverted_rule() {
        let rule = FilteringRule::port(1080).invert().and(FilteringRule::host("sekai.net"));
        assert!(rule.is_allowed("sekai.net", 80));
        assert!(!rule.is_allowed("sekai.net", 1080));
        assert!(!rule.is_allowed("other.net", 80));
    }

    #[test]
    fn forwards_default_to_general_plugin() {
        let forward = LocalForward::new("127.0.0.1", 9000, Target::new("127.0.0.1", 80));
        assert_eq!(GENERAL_PLUGIN, forward.plugin);
        assert_eq!("ftp", forward.with_plugin("ftp").plugin);
    }
}
