use anyhow::Context as _;
use ssh1_mux::{LocalForward, RemoteForward, Target};

const SCHEME_SEPARATOR: &str = "://";

/// A forward given on the command line.
///
/// ```text
/// local://<BIND HOST>:<BIND PORT>/<HOST>:<PORT>[?plugin=<PLUGIN>]
/// remote://<SERVER PORT>/<HOST>:<PORT>[?plugin=<PLUGIN>]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpec {
    Local(LocalForward),
    Remote(RemoteForward),
}

impl ForwardSpec {
    pub fn parse_str(arg: &str) -> anyhow::Result<Self> {
        let (scheme, value) = arg
            .split_once(SCHEME_SEPARATOR)
            .context("invalid format: missing scheme (e.g.: local://<BINDING ADDRESS>/<DESTINATION>)")?;

        let (value, plugin) = match value.split_once('?') {
            Some((value, query)) => (value, Some(parse_plugin(query)?)),
            None => (value, None),
        };

        let (listen_part, target_part) = value.split_once('/').context("destination is missing")?;
        let target = Target::parse_str(target_part).context("bad destination")?;

        match scheme {
            "local" => {
                let bind = Target::parse_str(listen_part).context("bad binding address")?;
                let mut forward = LocalForward::new(bind.host, bind.port, target);

                if let Some(plugin) = plugin {
                    forward = forward.with_plugin(plugin);
                }

                Ok(Self::Local(forward))
            }
            "remote" => {
                let server_port = listen_part.parse().context("bad server port")?;
                let mut forward = RemoteForward::new(server_port, target);

                if let Some(plugin) = plugin {
                    forward = forward.with_plugin(plugin);
                }

                Ok(Self::Remote(forward))
            }
            _ => anyhow::bail!("unknown forward scheme: {scheme}"),
        }
    }
}

fn parse_plugin(query: &str) -> anyhow::Result<&str> {
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("plugin", plugin)) if !plugin.is_empty() => return Ok(plugin),
            Some(("plugin", _)) => anyhow::bail!("empty plugin name"),
            _ => anyhow::bail!("unknown forward option: `{pair}`"),
        }
    }

    anyhow::bail!("empty forward options")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use proptest::prelude::*;
    use ssh1_mux::{FTP_PLUGIN, GENERAL_PLUGIN};

    use super::*;

    #[test]
    fn local_forward() {
        let ForwardSpec::Local(forward) = ForwardSpec::parse_str("local://127.0.0.1:8080/intranet:80").unwrap() else {
            panic!("expected a local forward");
        };

        assert_eq!("127.0.0.1", forward.bind_host);
        assert_eq!(8080, forward.bind_port);
        assert_eq!(Target::new("intranet", 80), forward.target);
        assert_eq!(GENERAL_PLUGIN, forward.plugin);
    }

    #[test]
    fn local_forward_with_plugin() {
        let spec = ForwardSpec::parse_str("local://localhost:2121/ftp.example.com:21?plugin=ftp").unwrap();

        assert_eq!(
            ForwardSpec::Local(
                LocalForward::new("localhost", 2121, Target::new("ftp.example.com", 21)).with_plugin(FTP_PLUGIN)
            ),
            spec
        );
    }

    #[test]
    fn ipv6_binding_address() {
        let ForwardSpec::Local(forward) = ForwardSpec::parse_str("local://[::1]:8080/intranet:80").unwrap() else {
            panic!("expected a local forward");
        };

        assert_eq!("::1", forward.bind_host);
    }

    #[test]
    fn remote_forward() {
        assert_eq!(
            ForwardSpec::Remote(RemoteForward::new(9000, Target::new("127.0.0.1", 3000))),
            ForwardSpec::parse_str("remote://9000/127.0.0.1:3000").unwrap()
        );
    }

    #[test]
    fn bad_forwards() {
        assert!(ForwardSpec::parse_str("127.0.0.1:8080/intranet:80").is_err());
        assert!(ForwardSpec::parse_str("local://127.0.0.1:8080").is_err());
        assert!(ForwardSpec::parse_str("local://127.0.0.1/intranet:80").is_err());
        assert!(ForwardSpec::parse_str("local://127.0.0.1:8080/intranet").is_err());
        assert!(ForwardSpec::parse_str("remote://http/127.0.0.1:3000").is_err());
        assert!(ForwardSpec::parse_str("remote://70000/127.0.0.1:3000").is_err());
        assert!(ForwardSpec::parse_str("socks5://127.0.0.1:1080/intranet:80").is_err());
        assert!(ForwardSpec::parse_str("local://127.0.0.1:21/ftp:21?plugin=").is_err());
        assert!(ForwardSpec::parse_str("local://127.0.0.1:21/ftp:21?mode=active").is_err());
    }

    proptest! {
        #[test]
        fn any_local_forward(bind_port in any::<u16>(), host in "[a-z][a-z0-9-]{0,20}(\\.[a-z]{2,5})?", port in any::<u16>()) {
            let spec = ForwardSpec::parse_str(&format!("local://0.0.0.0:{bind_port}/{host}:{port}")).unwrap();
            prop_assert_eq!(ForwardSpec::Local(LocalForward::new("0.0.0.0", bind_port, Target::new(host, port))), spec);
        }
    }
}
