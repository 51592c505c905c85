use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::api::TunnelHandle;
use crate::config::{FtpConfig, LocalForward};
use crate::ftp::FtpPlugin;

pub const GENERAL_PLUGIN: &str = "general";
pub const FTP_PLUGIN: &str = "ftp";

/// Strategy attached to a forwarding type.
///
/// A plugin decides how listeners for its forwards are bound and may attach a
/// [`PayloadFilter`] to every channel opened through them.
pub trait ProtocolPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Binds the listener of a local forward.
    fn local_listener(&self, forward: &LocalForward) -> io::Result<std::net::TcpListener> {
        bind_listener(&forward.bind_host, forward.bind_port)
    }

    fn new_filter(&self, ctx: &PluginContext) -> Option<Box<dyn PayloadFilter>> {
        let _ = ctx;
        None
    }
}

/// Rewrites payloads of a single channel.
///
/// Hooks run on the pump tasks and must not block.
pub trait PayloadFilter: Send {
    /// Bytes read from the local socket, about to be sent to the peer.
    fn to_peer(&mut self, data: Bytes) -> Bytes {
        data
    }

    /// Bytes received from the peer, about to be written to the local socket.
    fn to_local(&mut self, data: Bytes) -> Bytes {
        data
    }
}

pub(crate) type SharedFilter = Arc<Mutex<Box<dyn PayloadFilter>>>;

/// What a plugin knows about the channel it filters.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub handle: TunnelHandle,
    /// Address of our end of the local socket.
    pub local_ip: IpAddr,
    pub ftp: FtpConfig,
}

/// Plain byte forwarding.
#[derive(Debug, Default)]
pub struct GeneralPlugin;

impl ProtocolPlugin for GeneralPlugin {
    fn name(&self) -> &str {
        GENERAL_PLUGIN
    }
}

/// Plugins available to a session, by name.
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ProtocolPlugin>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(GeneralPlugin);
        registry.register(FtpPlugin);
        registry
    }
}

impl PluginRegistry {
    /// A registry with the `general` and `ftp` plugins.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Adds a plugin, replacing any previous plugin with the same name.
    pub fn register(&mut self, plugin: impl ProtocolPlugin + 'static) {
        self.plugins.insert(plugin.name().to_owned(), Arc::new(plugin));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.names()).finish()
    }
}

/// Binds a non-blocking listener, ready to be handed to tokio.
pub(crate) fn bind_listener(host: &str, port: u16) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    struct Upper;

    impl PayloadFilter for Upper {
        fn to_peer(&mut self, data: Bytes) -> Bytes {
            Bytes::from(data.to_ascii_uppercase())
        }
    }

    struct Shouting;

    impl ProtocolPlugin for Shouting {
        fn name(&self) -> &str {
            "shouting"
        }

        fn new_filter(&self, _: &PluginContext) -> Option<Box<dyn PayloadFilter>> {
            Some(Box::new(Upper))
        }
    }

    #[test]
    fn default_registry() {
        let registry = PluginRegistry::new();
        assert_eq!(vec![FTP_PLUGIN, GENERAL_PLUGIN], registry.names());
        assert!(registry.get("socks").is_none());
    }

    #[test]
    fn custom_plugin() {
        let mut registry = PluginRegistry::empty();
        registry.register(Shouting);

        let plugin = registry.get("shouting").unwrap();
        let (request_tx, _request_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = PluginContext {
            handle: TunnelHandle::new(request_tx),
            local_ip: IpAddr::from([127, 0, 0, 1]),
            ftp: FtpConfig::default(),
        };

        let mut filter = plugin.new_filter(&ctx).unwrap();
        assert_eq!(Bytes::from_static(b"HELLO"), filter.to_peer(Bytes::from_static(b"hello")));
        assert_eq!(Bytes::from_static(b"hello"), filter.to_local(Bytes::from_static(b"hello")));
    }

    #[test]
    fn general_plugin_has_no_filter() {
        let (request_tx, _request_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = PluginContext {
            handle: TunnelHandle::new(request_tx),
            local_ip: IpAddr::from([127, 0, 0, 1]),
            ftp: FtpConfig::default(),
        };

        assert!(GeneralPlugin.new_filter(&ctx).is_none());
    }

    #[test]
    fn default_listener_binds_requested_address() {
        let forward = LocalForward::new("127.0.0.1", 0, crate::Target::new("127.0.0.1", 80));
        let listener = GeneralPlugin.local_listener(&forward).unwrap();
        let addr = listener.local_addr().unwrap();

        assert_eq!(IpAddr::from([127, 0, 0, 1]), addr.ip());
        assert_ne!(0, addr.port());
    }
}
