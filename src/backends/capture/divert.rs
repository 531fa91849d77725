// WinDivert capture backend
//
// The only module that touches the divert driver's raw buffers and its
// fixed-size address structure; everything above sees the safe trait API.
// Packets are captured at the network layer before final transmission, so
// a packet that is not reinjected is gone.

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use windivert_sys as wd;
use windows::Win32::Foundation::GetLastError;

use super::{CaptureError, CaptureOpener, PacketCapture, PacketMeta, StartError};

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_NO_DATA: u32 = 232;
const ERROR_OPERATION_ABORTED: u32 = 995;
const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;

/// Files the driver stack loads from the executable's directory.
const DIVERT_DLL: &str = "WinDivert.dll";
const DIVERT_SYS: &str = "WinDivert64.sys";

pub struct DivertOpener;

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl CaptureOpener for DivertOpener {
    fn name(&self) -> &'static str {
        "divert"
    }

    fn preflight(&self) -> Result<(), StartError> {
        let dir = exe_dir();
        let dll = dir.join(DIVERT_DLL);
        if !dll.exists() {
            return Err(StartError::MissingCaptureLib(dll.display().to_string()));
        }
        let sys = dir.join(DIVERT_SYS);
        if !sys.exists() {
            return Err(StartError::MissingDriverFile(sys.display().to_string()));
        }
        Ok(())
    }

    fn open(&self, filter: &str) -> Result<Arc<dyn PacketCapture>, StartError> {
        let filter_c = CString::new(filter).map_err(|_| StartError::Other {
            code: 0,
            msg: "filter contains an interior NUL".into(),
        })?;

        let handle = unsafe {
            wd::WinDivertOpen(
                filter_c.as_ptr(),
                wd::WinDivertLayer::Network,
                0,
                wd::WinDivertFlags::new(),
            )
        };
        if handle.is_null() || handle as isize == -1 {
            let code = unsafe { GetLastError().0 };
            return Err(match code {
                ERROR_ACCESS_DENIED => StartError::AccessDenied,
                ERROR_FILE_NOT_FOUND | ERROR_SERVICE_DOES_NOT_EXIST => StartError::DriverNotLoaded,
                other => StartError::Other {
                    code: other as i32,
                    msg: "WinDivertOpen failed".into(),
                },
            });
        }

        log::info!("divert capture opened with filter: {}", filter);
        Ok(Arc::new(DivertCapture {
            handle,
            closed: AtomicBool::new(false),
        }))
    }
}

struct DivertCapture {
    handle: wd::HANDLE,
    closed: AtomicBool,
}

// The driver serializes operations on one handle internally; recv, send and
// shutdown are documented safe from different threads.
unsafe impl Send for DivertCapture {}
unsafe impl Sync for DivertCapture {}

impl PacketCapture for DivertCapture {
    fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketMeta), CaptureError> {
        let mut addr: wd::address::WINDIVERT_ADDRESS = unsafe { std::mem::zeroed() };
        let mut recv_len: u32 = 0;

        let ok = unsafe {
            wd::WinDivertRecv(
                self.handle,
                buf.as_mut_ptr() as *mut _,
                buf.len() as u32,
                &mut recv_len,
                &mut addr,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError().0 };
            if self.closed.load(Ordering::SeqCst) {
                return Err(CaptureError::Closed);
            }
            return Err(match code {
                ERROR_NO_DATA | ERROR_INVALID_HANDLE | ERROR_OPERATION_ABORTED => {
                    CaptureError::Closed
                }
                other => CaptureError::Io(other as i32),
            });
        }

        Ok((
            recv_len as usize,
            PacketMeta {
                outbound: addr.outbound(),
                ipv6: addr.ipv6(),
                divert: addr,
            },
        ))
    }

    fn send(&self, buf: &[u8], meta: &PacketMeta) -> Result<(), CaptureError> {
        let addr = meta.divert;
        let mut sent: u32 = 0;
        let ok = unsafe {
            wd::WinDivertSend(
                self.handle,
                buf.as_ptr() as *const _,
                buf.len() as u32,
                &mut sent,
                &addr,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError().0 };
            return Err(CaptureError::Io(code as i32));
        }
        Ok(())
    }

    fn fix_checksums(&self, buf: &mut [u8], meta: &PacketMeta) {
        let mut addr = meta.divert;
        // Offload-mangled checksums would make the reinjected packet
        // undeliverable; failures here are swallowed and the packet goes
        // out as captured.
        unsafe {
            wd::WinDivertHelperCalcChecksums(
                buf.as_mut_ptr() as *mut _,
                buf.len() as u32,
                &mut addr,
                wd::ChecksumFlags::new(),
            );
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            // Shutdown aborts a receive blocked in the kernel before the
            // handle itself goes away.
            wd::WinDivertShutdown(self.handle, wd::WinDivertShutdownMode::Both);
            wd::WinDivertClose(self.handle);
        }
        log::debug!("divert capture closed");
    }
}

impl Drop for DivertCapture {
    fn drop(&mut self) {
        self.close();
    }
}
