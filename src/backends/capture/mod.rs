// Packet capture hook
//
// The kernel-facing side of the engine: a blocking receive of diverted
// packets with direction metadata, best-effort reinjection with checksum
// repair, and a close that unblocks a pending receive from another thread.

use std::sync::Arc;

use thiserror::Error;

use super::{BackendInfo, BackendPriority};

#[cfg(windows)]
pub mod divert;
pub mod sim;

/// Capture filter: IPv4 TCP and UDP only. Nothing else enters the pipeline.
pub const FILTER: &str = "ip and (tcp or udp)";

/// Receive buffer size; one diverted read never exceeds this.
pub const RECV_BUF_LEN: usize = 64 * 1024;

/// Why `start()` failed before any packet was handled.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("packet driver file missing: {0}")]
    MissingDriverFile(String),
    #[error("capture library missing: {0}")]
    MissingCaptureLib(String),
    #[error("access denied opening the capture hook (run with elevated privileges)")]
    AccessDenied,
    #[error("packet driver not loaded (install or start the driver service)")]
    DriverNotLoaded,
    #[error("capture open failed (code {code}): {msg}")]
    Other { code: i32, msg: String },
}

impl StartError {
    /// CLI exit code for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartError::MissingDriverFile(_) | StartError::MissingCaptureLib(_) => 2,
            StartError::AccessDenied => 3,
            StartError::DriverNotLoaded => 4,
            StartError::Other { .. } => 1,
        }
    }
}

/// Errors on the packet path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The handle was closed; the receive loop exits cleanly.
    #[error("capture handle closed")]
    Closed,
    /// The hook itself failed, by OS error code.
    #[error("capture i/o error (code {0})")]
    Io(i32),
}

/// Kernel metadata delivered with each captured packet.
#[derive(Clone, Copy, PartialEq)]
pub struct PacketMeta {
    /// Host-originated (upload direction) when set.
    pub outbound: bool,
    /// Captured outside IPv4; such packets bypass accounting and policy.
    pub ipv6: bool,
    #[cfg(windows)]
    pub(crate) divert: windivert_sys::address::WINDIVERT_ADDRESS,
}

impl PacketMeta {
    pub fn new(outbound: bool, ipv6: bool) -> Self {
        #[cfg(windows)]
        {
            let mut divert: windivert_sys::address::WINDIVERT_ADDRESS =
                unsafe { std::mem::zeroed() };
            divert.set_outbound(outbound);
            divert.set_ipv6(ipv6);
            Self {
                outbound,
                ipv6,
                divert,
            }
        }
        #[cfg(not(windows))]
        Self { outbound, ipv6 }
    }
}

impl std::fmt::Debug for PacketMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketMeta")
            .field("outbound", &self.outbound)
            .field("ipv6", &self.ipv6)
            .finish()
    }
}

/// An open capture handle. All operations may be called from any thread;
/// `close` unblocks a `recv` pending on another thread.
pub trait PacketCapture: Send + Sync {
    /// Block until the next matching packet arrives, the handle is closed
    /// (`CaptureError::Closed`), or the hook fails.
    fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketMeta), CaptureError>;

    /// Reinject a packet toward its destination. Best-effort: a failed send
    /// is a lost packet, indistinguishable from a natural drop.
    fn send(&self, buf: &[u8], meta: &PacketMeta) -> Result<(), CaptureError>;

    /// Recompute network and transport checksums in place. Best-effort;
    /// failures are swallowed and the packet goes out as-is.
    fn fix_checksums(&self, buf: &mut [u8], meta: &PacketMeta);

    /// Close the handle. Idempotent.
    fn close(&self);
}

/// Opens capture handles for one hook implementation.
pub trait CaptureOpener: Send + Sync {
    /// Backend name (e.g. "divert", "sim").
    fn name(&self) -> &'static str;

    /// Cheap environment checks that should fail before open is attempted.
    fn preflight(&self) -> Result<(), StartError>;

    /// Establish capture with `filter`.
    fn open(&self, filter: &str) -> Result<Arc<dyn PacketCapture>, StartError>;
}

/// Detect capture backends on this system.
pub fn detect_capture_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(windows)]
    backends.push(BackendInfo {
        name: "divert",
        priority: BackendPriority::Best,
        available: divert::DivertOpener.preflight().is_ok(),
    });

    backends.push(BackendInfo {
        name: "sim",
        priority: BackendPriority::Fallback,
        available: true,
    });

    backends
}

/// Select a capture backend, honoring an explicit preference.
pub fn select_capture_backend(preference: Option<&str>) -> anyhow::Result<Box<dyn CaptureOpener>> {
    if let Some(name) = preference {
        return create_capture_backend(name);
    }

    detect_capture_backends()
        .iter()
        .filter(|backend| backend.available)
        .max_by_key(|backend| backend.priority)
        .map(|info| create_capture_backend(info.name))
        .unwrap_or_else(|| anyhow::bail!("no capture backend available"))
}

fn create_capture_backend(name: &str) -> anyhow::Result<Box<dyn CaptureOpener>> {
    match name {
        #[cfg(windows)]
        "divert" => Ok(Box::new(divert::DivertOpener)),
        "sim" => Ok(Box::new(sim::SimHandle::new().opener())),
        other => anyhow::bail!("unknown capture backend: {}", other),
    }
}
