// Port-to-process resolution

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::backends::ports::PortTableBackend;
use crate::packet::Proto;

/// How long a published port map stays current before the packet path asks
/// for a rebuild.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(1500);

/// Maps local ports to owning PIDs for TCP and UDP.
///
/// Both maps are immutable snapshots behind an atomic reference: the packet
/// path reads whichever snapshot is current without locking, while
/// `refresh` builds replacements from the OS tables off-path and swaps them
/// in whole. A reader sees either the old complete map or the new complete
/// map, never a partial one.
pub struct PortResolver {
    tcp: ArcSwap<HashMap<u16, u32>>,
    udp: ArcSwap<HashMap<u16, u32>>,
    backend: Box<dyn PortTableBackend>,
}

impl PortResolver {
    pub fn new(backend: Box<dyn PortTableBackend>) -> Self {
        Self {
            tcp: ArcSwap::from_pointee(HashMap::new()),
            udp: ArcSwap::from_pointee(HashMap::new()),
            backend,
        }
    }

    /// Owning PID for a bound local port, or 0 when unknown.
    pub fn resolve(&self, proto: Proto, port: u16) -> u32 {
        let map = match proto {
            Proto::Tcp => self.tcp.load(),
            Proto::Udp => self.udp.load(),
        };
        map.get(&port).copied().unwrap_or(0)
    }

    /// Rebuild both maps from the OS tables and publish them atomically.
    /// Ports owned by PID 0 are dropped; a port listed twice keeps the last
    /// owner the table reported.
    pub fn refresh(&self) -> Result<()> {
        let tables = self.backend.port_tables()?;
        self.tcp.store(Arc::new(build_map(tables.tcp)));
        self.udp.store(Arc::new(build_map(tables.udp)));
        Ok(())
    }

    /// Every PID currently owning a TCP or UDP port.
    pub fn pids(&self) -> HashSet<u32> {
        let mut pids: HashSet<u32> = self.tcp.load().values().copied().collect();
        pids.extend(self.udp.load().values().copied());
        pids
    }
}

fn build_map(entries: Vec<(u16, u32)>) -> HashMap<u16, u32> {
    let mut map = HashMap::with_capacity(entries.len());
    for (port, pid) in entries {
        if pid == 0 {
            continue;
        }
        map.insert(port, pid);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ports::static_tables::StaticPortTables;
    use crate::backends::ports::PortTables;

    fn resolver_with(tables: PortTables) -> (PortResolver, Arc<StaticPortTables>) {
        let backend = Arc::new(StaticPortTables::new(tables));
        let resolver = PortResolver::new(Box::new(Arc::clone(&backend)));
        (resolver, backend)
    }

    #[test]
    fn test_resolve_after_refresh() {
        let (resolver, _) = resolver_with(PortTables {
            tcp: vec![(8080, 100)],
            udp: vec![(53, 200)],
        });
        // nothing resolves until the first refresh publishes a map
        assert_eq!(resolver.resolve(Proto::Tcp, 8080), 0);

        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve(Proto::Tcp, 8080), 100);
        assert_eq!(resolver.resolve(Proto::Udp, 53), 200);
        assert_eq!(resolver.resolve(Proto::Udp, 8080), 0);
        assert_eq!(resolver.resolve(Proto::Tcp, 1), 0);
    }

    #[test]
    fn test_pid_zero_entries_are_excluded() {
        let (resolver, _) = resolver_with(PortTables {
            tcp: vec![(80, 0), (81, 7)],
            udp: vec![],
        });
        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve(Proto::Tcp, 80), 0);
        assert_eq!(resolver.resolve(Proto::Tcp, 81), 7);
    }

    #[test]
    fn test_duplicate_port_keeps_last_owner() {
        let (resolver, _) = resolver_with(PortTables {
            tcp: vec![(443, 10), (443, 20)],
            udp: vec![],
        });
        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve(Proto::Tcp, 443), 20);
    }

    #[test]
    fn test_same_port_disambiguated_by_protocol() {
        let (resolver, _) = resolver_with(PortTables {
            tcp: vec![(5000, 11)],
            udp: vec![(5000, 22)],
        });
        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve(Proto::Tcp, 5000), 11);
        assert_eq!(resolver.resolve(Proto::Udp, 5000), 22);
    }

    #[test]
    fn test_refresh_publishes_whole_map() {
        let (resolver, backend) = resolver_with(PortTables {
            tcp: vec![(1000, 1)],
            udp: vec![],
        });
        resolver.refresh().unwrap();

        // the source changes underneath; readers keep the published
        // snapshot until the next refresh swaps in the rebuilt map
        backend.set(PortTables {
            tcp: vec![(1000, 2), (2000, 3)],
            udp: vec![],
        });
        assert_eq!(resolver.resolve(Proto::Tcp, 1000), 1);
        assert_eq!(resolver.resolve(Proto::Tcp, 2000), 0);

        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve(Proto::Tcp, 1000), 2);
        assert_eq!(resolver.resolve(Proto::Tcp, 2000), 3);
    }

    #[test]
    fn test_pids_unions_both_protocols() {
        let (resolver, _) = resolver_with(PortTables {
            tcp: vec![(1, 10), (2, 11)],
            udp: vec![(3, 11), (4, 12)],
        });
        resolver.refresh().unwrap();
        let pids = resolver.pids();
        assert_eq!(pids, HashSet::from([10, 11, 12]));
    }
}
