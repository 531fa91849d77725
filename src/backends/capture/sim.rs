// Simulated capture backend
//
// An in-memory packet queue behind the capture traits. Packets injected
// through the handle flow through the whole engine; whatever the engine
// reinjects is collected for inspection. Drives the end-to-end tests and
// doubles as a smoke backend on hosts without a divert driver.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use super::{CaptureError, CaptureOpener, PacketCapture, PacketMeta, StartError};

#[derive(Default)]
struct SimState {
    queue: Mutex<SimQueue>,
    ready: Condvar,
}

#[derive(Default)]
struct SimQueue {
    pending: VecDeque<(Vec<u8>, PacketMeta)>,
    reinjected: Vec<(Vec<u8>, PacketMeta)>,
    reinjected_bytes: u64,
    closed: bool,
}

/// Injection side of the simulated hook. Clones share one queue; keep one
/// around to feed packets and read back what survived enforcement.
#[derive(Clone, Default)]
pub struct SimHandle {
    state: Arc<SimState>,
}

impl SimHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one packet for the engine to receive.
    pub fn inject(&self, data: Vec<u8>, meta: PacketMeta) {
        let mut queue = self.state.queue.lock().unwrap();
        queue.pending.push_back((data, meta));
        self.state.ready.notify_one();
    }

    /// Drain the packets the engine has reinjected so far.
    pub fn take_reinjected(&self) -> Vec<(Vec<u8>, PacketMeta)> {
        std::mem::take(&mut self.state.queue.lock().unwrap().reinjected)
    }

    /// Total bytes reinjected so far (not reset by `take_reinjected`).
    pub fn reinjected_bytes(&self) -> u64 {
        self.state.queue.lock().unwrap().reinjected_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.state.queue.lock().unwrap().closed
    }

    /// Capture opener bound to this handle's queue.
    pub fn opener(&self) -> SimOpener {
        SimOpener {
            state: Arc::clone(&self.state),
        }
    }
}

pub struct SimOpener {
    state: Arc<SimState>,
}

impl CaptureOpener for SimOpener {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn preflight(&self) -> Result<(), StartError> {
        Ok(())
    }

    fn open(&self, _filter: &str) -> Result<Arc<dyn PacketCapture>, StartError> {
        // reopening clears the closed flag so one handle can drive several
        // engine runs
        self.state.queue.lock().unwrap().closed = false;
        Ok(Arc::new(SimCapture {
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimCapture {
    state: Arc<SimState>,
}

impl PacketCapture for SimCapture {
    fn recv(&self, buf: &mut [u8]) -> Result<(usize, PacketMeta), CaptureError> {
        let mut queue = self.state.queue.lock().unwrap();
        loop {
            if let Some((data, meta)) = queue.pending.pop_front() {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                return Ok((len, meta));
            }
            if queue.closed {
                return Err(CaptureError::Closed);
            }
            queue = self.state.ready.wait(queue).unwrap();
        }
    }

    fn send(&self, buf: &[u8], meta: &PacketMeta) -> Result<(), CaptureError> {
        let mut queue = self.state.queue.lock().unwrap();
        queue.reinjected_bytes += buf.len() as u64;
        queue.reinjected.push((buf.to_vec(), *meta));
        Ok(())
    }

    fn fix_checksums(&self, _buf: &mut [u8], _meta: &PacketMeta) {}

    fn close(&self) {
        let mut queue = self.state.queue.lock().unwrap();
        queue.closed = true;
        self.state.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_recv_returns_injected_packets_in_order() {
        let handle = SimHandle::new();
        let capture = handle.opener().open("ip and (tcp or udp)").unwrap();

        handle.inject(vec![1, 2, 3], PacketMeta::new(false, false));
        handle.inject(vec![4, 5], PacketMeta::new(true, false));

        let mut buf = [0u8; 16];
        let (len, meta) = capture.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);
        assert!(!meta.outbound);

        let (len, meta) = capture.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[4, 5]);
        assert!(meta.outbound);
    }

    #[test]
    fn test_close_unblocks_pending_recv() {
        let handle = SimHandle::new();
        let capture = handle.opener().open("ip and (tcp or udp)").unwrap();

        let blocked = {
            let capture = Arc::clone(&capture);
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                capture.recv(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        capture.close();
        assert_eq!(blocked.join().unwrap(), Err(CaptureError::Closed));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_send_collects_reinjected_packets() {
        let handle = SimHandle::new();
        let capture = handle.opener().open("ip and (tcp or udp)").unwrap();

        capture
            .send(&[9, 9, 9], &PacketMeta::new(false, false))
            .unwrap();
        assert_eq!(handle.reinjected_bytes(), 3);
        let taken = handle.take_reinjected();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, vec![9, 9, 9]);
        assert!(handle.take_reinjected().is_empty());
    }
}
