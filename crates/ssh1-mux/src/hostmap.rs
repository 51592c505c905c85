use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostMapEntry {
    to_host: String,
    to_port: u16,
    temporary: bool,
}

/// Rewrites the target of peer-initiated port opens.
///
/// Temporary entries are consumed by the first lookup.
#[derive(Debug, Default)]
pub(crate) struct HostMap {
    entries: HashMap<String, HostMapEntry>,
}

impl HostMap {
    pub(crate) fn add(&mut self, from_host: String, to_host: String, to_port: u16, temporary: bool) {
        debug!(%from_host, %to_host, to_port, temporary, "Host mapping added");

        self.entries.insert(
            from_host,
            HostMapEntry {
                to_host,
                to_port,
                temporary,
            },
        );
    }

    pub(crate) fn del(&mut self, from_host: &str) -> bool {
        self.entries.remove(from_host).is_some()
    }

    pub(crate) fn resolve(&mut self, from_host: &str) -> Option<(String, u16)> {
        let entry = self.entries.get(from_host)?;
        let target = (entry.to_host.clone(), entry.to_port);

        if entry.temporary {
            self.entries.remove(from_host);
        }

        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_entry_is_consumed() {
        let mut map = HostMap::default();
        map.add("ftp-data".to_owned(), "10.0.0.5".to_owned(), 20, true);

        assert_eq!(Some(("10.0.0.5".to_owned(), 20)), map.resolve("ftp-data"));
        assert_eq!(None, map.resolve("ftp-data"));
    }

    #[test]
    fn permanent_entry_stays() {
        let mut map = HostMap::default();
        map.add("intranet".to_owned(), "192.168.1.10".to_owned(), 8080, false);

        assert_eq!(Some(("192.168.1.10".to_owned(), 8080)), map.resolve("intranet"));
        assert_eq!(Some(("192.168.1.10".to_owned(), 8080)), map.resolve("intranet"));
    }

    #[test]
    fn delete() {
        let mut map = HostMap::default();
        map.add("intranet".to_owned(), "192.168.1.10".to_owned(), 8080, false);

        assert!(map.del("intranet"));
        assert!(!map.del("intranet"));
        assert_eq!(None, map.resolve("intranet"));
    }

    #[test]
    fn unknown_host() {
        let mut map = HostMap::default();
        assert_eq!(None, map.resolve("nowhere"));
    }
}
