// Intercept engine: the packet hot loop and its control surface

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::adaptive::AdaptiveController;
use crate::backends::capture::{
    CaptureError, CaptureOpener, PacketCapture, StartError, FILTER, RECV_BUF_LEN,
};
use crate::backends::ports::PortTableBackend;
use crate::bucket::{BucketKey, BucketMap};
use crate::counters::ByteCounters;
use crate::packet;
use crate::resolver::{PortResolver, REFRESH_INTERVAL};
use crate::rules::{Direction, Rule, RuleStore};
use crate::sampler::SamplerWindow;

/// Sampling and adaptive-control cadence.
const TICK_PERIOD: Duration = Duration::from_secs(1);
/// How long `stop` waits for the worker before abandoning it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// State shared by the worker thread, the ticker thread and the control
/// surface.
struct EngineShared {
    rules: RuleStore,
    buckets: Arc<BucketMap>,
    counters: ByteCounters,
    resolver: PortResolver,
    sampler: Mutex<SamplerWindow>,
    capture: Mutex<Option<Arc<dyn PacketCapture>>>,
    running: AtomicBool,
    packets_processed: AtomicU64,
    packets_dropped: AtomicU64,
}

/// The bandwidth governor. One engine value owns the capture handle, the
/// worker thread and the control ticker; rules and counters are manipulated
/// through it from any thread.
pub struct Engine {
    shared: Arc<EngineShared>,
    opener: Box<dyn CaptureOpener>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over the given capture hook and port-table source.
    pub fn new(opener: Box<dyn CaptureOpener>, ports: Box<dyn PortTableBackend>) -> Self {
        let buckets = Arc::new(BucketMap::new());
        Self {
            shared: Arc::new(EngineShared {
                rules: RuleStore::new(Arc::clone(&buckets)),
                buckets,
                counters: ByteCounters::new(),
                resolver: PortResolver::new(ports),
                sampler: Mutex::new(SamplerWindow::new()),
                capture: Mutex::new(None),
                running: AtomicBool::new(false),
                packets_processed: AtomicU64::new(0),
                packets_dropped: AtomicU64::new(0),
            }),
            opener,
            worker: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Start interception. Idempotent: calling on a running engine is a
    /// no-op. On failure nothing is left running.
    pub fn start(&self) -> Result<(), StartError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.opener.preflight() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        let capture = match self.opener.open(FILTER) {
            Ok(capture) => capture,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        // Seed the port maps before the first packet arrives; traffic in
        // the first refresh interval would otherwise resolve to nobody.
        if let Err(err) = self.shared.resolver.refresh() {
            log::warn!("initial port-map refresh failed: {:#}", err);
        }

        *self.shared.capture.lock().unwrap() = Some(Arc::clone(&capture));

        let shared = Arc::clone(&self.shared);
        *self.worker.lock().unwrap() = Some(thread::spawn(move || run_loop(shared, capture)));

        let shared = Arc::clone(&self.shared);
        *self.ticker.lock().unwrap() = Some(thread::spawn(move || run_ticker(shared)));

        log::info!("engine started ({} capture)", self.opener.name());
        Ok(())
    }

    /// Stop interception and release the capture handle. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Closing the handle unblocks a recv pending in the worker.
        if let Some(capture) = self.shared.capture.lock().unwrap().take() {
            capture.close();
        }

        if let Some(worker) = self.worker.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                // The handle is already closed, so the thread cannot block
                // in the kernel again; abandon it rather than hang the
                // caller.
                log::warn!(
                    "engine worker did not exit within {:?}, abandoning it",
                    JOIN_TIMEOUT
                );
            }
        }
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            let _ = ticker.join();
        }

        self.shared.counters.clear();
        self.shared.buckets.clear();
        self.shared.sampler.lock().unwrap().clear();
        log::info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn set_rule(&self, pid: u32, rule: Rule) {
        self.shared.rules.put(pid, rule);
    }

    pub fn set_rule_for_pids(&self, pids: &[u32], rule: &Rule) {
        self.shared.rules.put_many(pids, rule);
    }

    pub fn get_rule(&self, pid: u32) -> Option<Rule> {
        self.shared.rules.get(pid)
    }

    pub fn set_global_rule(&self, rule: Rule) {
        self.shared.rules.set_global(rule);
    }

    pub fn get_global_rule(&self) -> Rule {
        self.shared.rules.get_global()
    }

    /// Swap every per-PID byte counter to zero and return the bytes
    /// accumulated since the previous snapshot.
    pub fn snapshot_counters(&self) -> HashMap<u32, (u64, u64)> {
        self.shared.counters.snapshot_and_reset()
    }

    /// Swap the host-wide counters to zero and return them.
    pub fn snapshot_global_counters(&self) -> (u64, u64) {
        self.shared.counters.snapshot_global()
    }

    /// Cumulative host-wide byte totals (dl, ul) without resetting.
    pub fn global_totals(&self) -> (u64, u64) {
        self.shared.counters.global_totals()
    }

    /// Packets pulled from the hook since this engine was built.
    pub fn packets_processed(&self) -> u64 {
        self.shared.packets_processed.load(Ordering::Relaxed)
    }

    /// Packets dropped by policy since this engine was built.
    pub fn packets_dropped(&self) -> u64 {
        self.shared.packets_dropped.load(Ordering::Relaxed)
    }

    /// Rolling-average throughput (dl, ul bytes/sec) per PID.
    pub fn process_rates(&self) -> HashMap<u32, (f64, f64)> {
        self.shared.sampler.lock().unwrap().process_averages()
    }

    /// Rolling-average host-wide throughput (dl, ul bytes/sec).
    pub fn global_rates(&self) -> (f64, f64) {
        let sampler = self.shared.sampler.lock().unwrap();
        (
            sampler.global_average(Direction::Download),
            sampler.global_average(Direction::Upload),
        )
    }

    /// Rebuild the port maps outside the packet path (used to list
    /// processes while the engine is not running).
    pub fn refresh_port_maps(&self) -> anyhow::Result<()> {
        self.shared.resolver.refresh()
    }

    /// Processes that currently own a TCP or UDP port, plus processes with
    /// a configured rule. PIDs whose process has exited are skipped.
    pub fn list_network_processes(&self) -> Vec<(u32, String)> {
        let mut pids = self.shared.resolver.pids();
        pids.extend(self.shared.rules.pids());

        let sys = sysinfo::System::new_all();
        let mut processes: Vec<(u32, String)> = pids
            .into_iter()
            .filter_map(|pid| {
                sys.process(sysinfo::Pid::from_u32(pid))
                    .and_then(|process| process.name().to_str())
                    .map(|name| (pid, name.to_string()))
            })
            .collect();
        processes.sort_by_key(|&(pid, _)| pid);
        processes
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The hot loop. One packet at a time: receive, classify, account, enforce
/// the global rule, enforce the per-process rule, reinject. Nothing here is
/// fatal except a closed handle; malformed input is reinjected untouched
/// and the loop moves on.
fn run_loop(shared: Arc<EngineShared>, capture: Arc<dyn PacketCapture>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut last_refresh = Instant::now();

    loop {
        let (len, meta) = match capture.recv(&mut buf) {
            Ok(received) => received,
            Err(CaptureError::Closed) => break,
            Err(err) => {
                // Not a shutdown: the hook itself failed. One log line and
                // the engine stays down until restarted.
                if shared.running.swap(false, Ordering::SeqCst) {
                    log::error!("capture receive failed: {}", err);
                    if let Some(capture) = shared.capture.lock().unwrap().take() {
                        capture.close();
                    }
                }
                break;
            }
        };

        shared.packets_processed.fetch_add(1, Ordering::Relaxed);

        // Non-IPv4 is outside policy: hand it straight back.
        if meta.ipv6 {
            let _ = capture.send(&buf[..len], &meta);
            continue;
        }

        if last_refresh.elapsed() >= REFRESH_INTERVAL {
            if let Err(err) = shared.resolver.refresh() {
                log::debug!("port-map refresh failed: {:#}", err);
            }
            last_refresh = Instant::now();
        }

        let Some(transport) = packet::parse_ipv4_transport(&buf[..len]) else {
            // Truncated or non-TCP/UDP payload: reinject untouched, no
            // accounting, no policy.
            let _ = capture.send(&buf[..len], &meta);
            continue;
        };

        let dir = if meta.outbound {
            Direction::Upload
        } else {
            Direction::Download
        };
        let pid = shared
            .resolver
            .resolve(transport.proto, transport.local_port(meta.outbound));

        // Accounting before enforcement: even a packet about to be dropped
        // has crossed the wire by now.
        if pid > 0 {
            shared.counters.record(pid, dir, len as u64);
        }
        shared.counters.record_global(dir, len as u64);

        // Global policy first. A packet the global cap rejects is never
        // charged to a per-process bucket.
        let global = shared.rules.get_global();
        if global.block_all {
            shared.packets_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if let Some(rate) = global.effective_rate(dir) {
            if !shared
                .buckets
                .try_consume(BucketKey::Global(dir), rate, len as u32)
            {
                shared.packets_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        if pid > 0 {
            if let Some(rule) = shared.rules.get(pid) {
                if rule.block_all {
                    shared.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if let Some(rate) = rule.effective_rate(dir) {
                    if !shared
                        .buckets
                        .try_consume(BucketKey::Pid(pid, dir), rate, len as u32)
                    {
                        shared.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
        }

        capture.fix_checksums(&mut buf[..len], &meta);
        if let Err(err) = capture.send(&buf[..len], &meta) {
            // a lost reinject is equivalent to a natural drop
            log::debug!("reinject failed: {}", err);
        }
    }

    log::debug!("engine worker exited");
}

/// The control ticker: once a second, turn counter deltas into throughput
/// samples and let the adaptive controller rewrite its rates. Reads
/// cumulative totals and differentiates locally, so the control surface's
/// snapshot-and-reset stays the only consumer of the swap.
fn run_ticker(shared: Arc<EngineShared>) {
    let mut controller = AdaptiveController::new();
    let mut last_totals: HashMap<u32, (u64, u64)> = HashMap::new();
    let mut last_global: (u64, u64) = (0, 0);
    let mut last_tick = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        thread::sleep(TICK_PERIOD);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let elapsed = last_tick.elapsed().as_secs_f64();
        last_tick = Instant::now();
        if elapsed <= 0.0 {
            continue;
        }

        let totals = shared.counters.totals();
        let mut rates: HashMap<u32, (f64, f64)> = HashMap::with_capacity(totals.len());
        for (&pid, &(dl, ul)) in &totals {
            let (last_dl, last_ul) = last_totals.get(&pid).copied().unwrap_or((0, 0));
            // saturating: an external snapshot may have reset the counters
            // under us, which reads as one silent tick
            rates.insert(
                pid,
                (
                    dl.saturating_sub(last_dl) as f64 / elapsed,
                    ul.saturating_sub(last_ul) as f64 / elapsed,
                ),
            );
        }
        last_totals = totals;

        let global = shared.counters.global_totals();
        let global_rates = (
            global.0.saturating_sub(last_global.0) as f64 / elapsed,
            global.1.saturating_sub(last_global.1) as f64 / elapsed,
        );
        last_global = global;

        let mut sampler = shared.sampler.lock().unwrap();
        sampler.push_tick(&rates, global_rates);
        controller.tick(&shared.rules, &sampler);
    }

    log::debug!("control ticker exited");
}
