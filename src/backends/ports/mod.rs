// Local-port ownership tables
//
// Per-OS sources of {local_port -> owning_pid} for TCP and UDP, IPv4 only.

use anyhow::Result;

use super::{BackendInfo, BackendPriority};

#[cfg(windows)]
pub mod iphelper;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod static_tables;

/// IPv4 port ownership, one entry per bound local port. Duplicate ports and
/// PID-0 entries are the resolver's problem; backends report the tables as
/// the OS hands them out.
#[derive(Debug, Clone, Default)]
pub struct PortTables {
    pub tcp: Vec<(u16, u32)>,
    pub udp: Vec<(u16, u32)>,
}

/// Source of the OS port-ownership tables.
pub trait PortTableBackend: Send + Sync {
    /// Backend name (e.g. "procfs", "iphelper").
    fn name(&self) -> &'static str;

    /// Read the current TCP and UDP tables.
    fn port_tables(&self) -> Result<PortTables>;
}

impl<T: PortTableBackend + ?Sized> PortTableBackend for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn port_tables(&self) -> Result<PortTables> {
        (**self).port_tables()
    }
}

/// Detect port-table backends on this system.
pub fn detect_ports_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(target_os = "linux")]
    backends.push(BackendInfo {
        name: "procfs",
        priority: BackendPriority::Best,
        available: procfs::ProcfsPortTables::is_available(),
    });

    #[cfg(windows)]
    backends.push(BackendInfo {
        name: "iphelper",
        priority: BackendPriority::Best,
        available: true,
    });

    backends.push(BackendInfo {
        name: "static",
        priority: BackendPriority::Fallback,
        available: true,
    });

    backends
}

/// Select a port-table backend, honoring an explicit preference.
pub fn select_ports_backend(preference: Option<&str>) -> Result<Box<dyn PortTableBackend>> {
    if let Some(name) = preference {
        return create_ports_backend(name);
    }

    detect_ports_backends()
        .iter()
        .filter(|backend| backend.available)
        .max_by_key(|backend| backend.priority)
        .map(|info| create_ports_backend(info.name))
        .unwrap_or_else(|| anyhow::bail!("no port-table backend available"))
}

fn create_ports_backend(name: &str) -> Result<Box<dyn PortTableBackend>> {
    match name {
        #[cfg(target_os = "linux")]
        "procfs" => Ok(Box::new(procfs::ProcfsPortTables::new()?)),
        #[cfg(windows)]
        "iphelper" => Ok(Box::new(iphelper::IpHelperPortTables::new()?)),
        "static" => Ok(Box::new(static_tables::StaticPortTables::default())),
        other => anyhow::bail!("unknown port-table backend: {}", other),
    }
}
