// Linux procfs port tables

use std::collections::HashMap;

use anyhow::Result;
use procfs::process::{all_processes, FDTarget};

use super::{PortTableBackend, PortTables};

/// Port ownership from /proc: the socket inodes of every readable process
/// joined with the IPv4 TCP and UDP socket tables.
///
/// Reads:
/// - /proc/[pid]/fd/ for socket inodes
/// - /proc/net/tcp for TCP IPv4 sockets
/// - /proc/net/udp for UDP IPv4 sockets
pub struct ProcfsPortTables;

impl ProcfsPortTables {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    pub fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }
}

impl PortTableBackend for ProcfsPortTables {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn port_tables(&self) -> Result<PortTables> {
        // Build the socket inode -> PID map by scanning all processes.
        // Unreadable processes (exited mid-scan, permissions) are skipped;
        // their sockets simply stay unattributed this round.
        let mut socket_to_pid: HashMap<u64, u32> = HashMap::new();
        for process in all_processes()?.flatten() {
            let pid = process.pid() as u32;
            if let Ok(fds) = process.fd() {
                for fd in fds.flatten() {
                    if let FDTarget::Socket(inode) = fd.target {
                        socket_to_pid.insert(inode, pid);
                    }
                }
            }
        }

        let mut tables = PortTables::default();

        if let Ok(entries) = procfs::net::tcp() {
            for entry in entries {
                if let Some(&pid) = socket_to_pid.get(&entry.inode) {
                    tables.tcp.push((entry.local_address.port(), pid));
                }
            }
        }

        if let Ok(entries) = procfs::net::udp() {
            for entry in entries {
                if let Some(&pid) = socket_to_pid.get(&entry.inode) {
                    tables.udp.push((entry.local_address.port(), pid));
                }
            }
        }

        log::debug!(
            "procfs port tables: {} tcp, {} udp entries",
            tables.tcp.len(),
            tables.udp.len()
        );

        Ok(tables)
    }
}
