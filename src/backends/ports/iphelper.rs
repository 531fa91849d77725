// Windows IP Helper port tables
//
// GetExtendedTcpTable and GetExtendedUdpTable enumerate IPv4 sockets with
// their owning PIDs; these are the same tables netstat and Task Manager
// read. Available on Windows XP SP2 and later.

use anyhow::Result;
use windows::Win32::Foundation::NO_ERROR;
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCPTABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID,
    TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
};
use windows::Win32::Networking::WinSock::AF_INET;

use super::{PortTableBackend, PortTables};

/// Port ownership from the IP Helper API (iphlpapi.dll).
pub struct IpHelperPortTables;

impl IpHelperPortTables {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl PortTableBackend for IpHelperPortTables {
    fn name(&self) -> &'static str {
        "iphelper"
    }

    fn port_tables(&self) -> Result<PortTables> {
        Ok(PortTables {
            tcp: tcp_ports()?,
            udp: udp_ports()?,
        })
    }
}

/// The table rows store the port in network byte order in the low 16 bits
/// of a DWORD.
fn port_from_dword(dword: u32) -> u16 {
    (((dword >> 8) & 0xff) | ((dword & 0xff) << 8)) as u16
}

fn tcp_ports() -> Result<Vec<(u16, u32)>> {
    unsafe {
        // First call sizes the buffer
        let mut size: u32 = 0;
        let _ = GetExtendedTcpTable(
            None,
            &mut size,
            false,
            AF_INET.0 as u32,
            TCP_TABLE_OWNER_PID_ALL,
            0,
        );
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; size as usize];
        let result = GetExtendedTcpTable(
            Some(buffer.as_mut_ptr() as *mut _),
            &mut size,
            false,
            AF_INET.0 as u32,
            TCP_TABLE_OWNER_PID_ALL,
            0,
        );
        if result != NO_ERROR.0 {
            anyhow::bail!("GetExtendedTcpTable failed with error code: {}", result);
        }

        let table = &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
        let mut entries = Vec::with_capacity(table.dwNumEntries as usize);
        for i in 0..table.dwNumEntries {
            let row = &table.table[i as usize];
            entries.push((port_from_dword(row.dwLocalPort), row.dwOwningPid));
        }
        Ok(entries)
    }
}

fn udp_ports() -> Result<Vec<(u16, u32)>> {
    unsafe {
        let mut size: u32 = 0;
        let _ = GetExtendedUdpTable(
            None,
            &mut size,
            false,
            AF_INET.0 as u32,
            UDP_TABLE_OWNER_PID,
            0,
        );
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; size as usize];
        let result = GetExtendedUdpTable(
            Some(buffer.as_mut_ptr() as *mut _),
            &mut size,
            false,
            AF_INET.0 as u32,
            UDP_TABLE_OWNER_PID,
            0,
        );
        if result != NO_ERROR.0 {
            anyhow::bail!("GetExtendedUdpTable failed with error code: {}", result);
        }

        let table = &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
        let mut entries = Vec::with_capacity(table.dwNumEntries as usize);
        for i in 0..table.dwNumEntries {
            let row = &table.table[i as usize];
            entries.push((port_from_dword(row.dwLocalPort), row.dwOwningPid));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_from_dword_swaps_network_order() {
        // port 443 = 0x01BB arrives as 0xBB01 in the low word
        assert_eq!(port_from_dword(0x0000_BB01), 443);
        assert_eq!(port_from_dword(0x0000_3500), 53);
        assert_eq!(port_from_dword(0x0000_0000), 0);
    }
}
