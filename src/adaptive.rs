// Adaptive rate control

use std::collections::{HashMap, HashSet};

use crate::rules::{Direction, RuleStore};
use crate::sampler::SamplerWindow;

/// Measured throughput below this (bytes/sec) counts as no traffic; the
/// controller holds still rather than chase noise.
const MIN_ACTIVITY: f64 = 100.0;
/// Above this measured/target ratio the rate shrinks.
const OVERSHOOT_RATIO: f64 = 1.02;
/// Below this ratio the rate grows gently; the band between is left alone.
const DEADBAND_LOW: f64 = 0.98;
/// Below this ratio the rate grows fast.
const DEEP_UNDERSHOOT: f64 = 0.90;
const FAST_GROWTH: f64 = 1.15;
const SLOW_GROWTH: f64 = 1.05;
/// The adjusted rate never drops below this fraction of the target.
const FLOOR_FRACTION: f64 = 0.05;

/// One proportional step moving `current` (bytes/sec) so that `measured`
/// converges on `target`. Overshoot shrinks harder the farther the miss;
/// undershoot grows multiplicatively; inside the deadband nothing moves.
pub(crate) fn control_step(target: f64, measured: f64, current: f64) -> f64 {
    if measured < MIN_ACTIVITY {
        return current;
    }
    let ratio = measured / target;
    let next = if ratio > OVERSHOOT_RATIO {
        current * (0.3 + 0.7 * target / measured)
    } else if ratio < DEEP_UNDERSHOOT {
        current * FAST_GROWTH
    } else if ratio < DEADBAND_LOW {
        current * SLOW_GROWTH
    } else {
        current
    };
    next.clamp(FLOOR_FRACTION * target, target)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKey {
    Global(Direction),
    Pid(u32, Direction),
}

struct StreamState {
    target: f64,
    adjusted: f64,
}

/// Periodic controller. Each tick rewrites the adjusted rate of every
/// adaptive limited stream so that its measured rolling average tracks the
/// configured target; the hot loop picks the new rate up on the next
/// packet. Under ordinary TCP feedback the measured average settles within
/// a few seconds.
#[derive(Default)]
pub struct AdaptiveController {
    streams: HashMap<StreamKey, StreamState>,
}

impl AdaptiveController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, rules: &RuleStore, sampler: &SamplerWindow) {
        let mut live: Vec<(StreamKey, f64, f64)> = Vec::new();

        let global = rules.get_global();
        if global.adaptive {
            for dir in [Direction::Download, Direction::Upload] {
                if global.limits(dir) {
                    live.push((
                        StreamKey::Global(dir),
                        global.target_rate(dir),
                        sampler.global_average(dir),
                    ));
                }
            }
        }

        for (pid, rule) in rules.entries() {
            if !rule.adaptive {
                continue;
            }
            for dir in [Direction::Download, Direction::Upload] {
                if rule.limits(dir) {
                    live.push((
                        StreamKey::Pid(pid, dir),
                        rule.target_rate(dir),
                        sampler.average(pid, dir),
                    ));
                }
            }
        }

        // forget streams that are gone or no longer adaptive, so turning
        // adaptive back on starts over from the target
        let keys: HashSet<StreamKey> = live.iter().map(|&(key, _, _)| key).collect();
        self.streams.retain(|key, _| keys.contains(key));

        for (key, target, measured) in live {
            let state = self
                .streams
                .entry(key)
                .or_insert(StreamState { target, adjusted: target });
            if state.target != target {
                // target changed: restart from it
                state.target = target;
                state.adjusted = target;
            }
            state.adjusted = control_step(target, measured, state.adjusted);

            match key {
                StreamKey::Global(dir) => rules.set_global_adjusted(dir, state.adjusted),
                StreamKey::Pid(pid, dir) => rules.set_adjusted(pid, dir, state.adjusted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketMap;
    use crate::rules::Rule;
    use std::sync::Arc;

    const TARGET: f64 = 100.0 * 1024.0;

    #[test]
    fn test_step_holds_without_traffic() {
        assert_eq!(control_step(TARGET, 0.0, TARGET), TARGET);
        assert_eq!(control_step(TARGET, 99.0, 5000.0), 5000.0);
    }

    #[test]
    fn test_step_shrinks_on_overshoot() {
        let next = control_step(TARGET, TARGET * 1.4, TARGET);
        assert!(next < TARGET);
        // a wilder miss shrinks harder
        let harder = control_step(TARGET, TARGET * 3.0, TARGET);
        assert!(harder < next);
    }

    #[test]
    fn test_step_grows_on_undershoot() {
        let deep = control_step(TARGET, TARGET * 0.5, TARGET * 0.5);
        assert!((deep - TARGET * 0.5 * 1.15).abs() < 1e-6);
        let slight = control_step(TARGET, TARGET * 0.95, TARGET * 0.95);
        assert!((slight - TARGET * 0.95 * 1.05).abs() < 1e-6);
    }

    #[test]
    fn test_step_deadband_holds() {
        let current = TARGET * 0.99;
        assert_eq!(control_step(TARGET, TARGET, current), current);
        assert_eq!(control_step(TARGET, TARGET * 1.01, current), current);
    }

    #[test]
    fn test_step_clamps_to_floor_and_target() {
        // collapse: even a huge overshoot cannot starve the stream
        let floored = control_step(TARGET, TARGET * 1000.0, TARGET * 0.06);
        assert!(floored >= TARGET * 0.05 - 1e-6);
        // growth cannot push the rate above the target
        let capped = control_step(TARGET, TARGET * 0.5, TARGET * 0.95);
        assert_eq!(capped, TARGET);
    }

    #[test]
    fn test_converges_against_overshooting_plant() {
        // plant model: actual throughput lands 40% above whatever rate the
        // bucket enforces, the way TCP fills any headroom it is given
        let mut adjusted = TARGET;
        let mut measured = adjusted * 1.4;
        for _ in 0..20 {
            adjusted = control_step(TARGET, measured, adjusted);
            measured = adjusted * 1.4;
        }
        assert!(adjusted < TARGET);
        assert!((measured - TARGET).abs() / TARGET <= 0.02);
    }

    fn fixture() -> (RuleStore, SamplerWindow) {
        let store = RuleStore::new(Arc::new(BucketMap::new()));
        (store, SamplerWindow::new())
    }

    fn adaptive_dl_rule(kbps: u32) -> Rule {
        Rule {
            limit_download: true,
            download_kbps: kbps,
            adaptive: true,
            ..Rule::default()
        }
    }

    fn feed(sampler: &mut SamplerWindow, pid: u32, dl: f64) {
        let mut rates = HashMap::new();
        rates.insert(pid, (dl, 0.0));
        sampler.push_tick(&rates, (dl, 0.0));
    }

    #[test]
    fn test_tick_writes_adjusted_rate_into_store() {
        let (store, mut sampler) = fixture();
        store.put(42, adaptive_dl_rule(100));
        feed(&mut sampler, 42, TARGET * 1.4);

        let mut controller = AdaptiveController::new();
        controller.tick(&store, &sampler);

        let rule = store.get(42).unwrap();
        assert!(rule.adjusted_dl_rate > 0.0);
        assert!(rule.adjusted_dl_rate < TARGET);
    }

    #[test]
    fn test_tick_resets_on_target_change() {
        let (store, mut sampler) = fixture();
        store.put(42, adaptive_dl_rule(100));
        feed(&mut sampler, 42, TARGET * 1.4);

        let mut controller = AdaptiveController::new();
        controller.tick(&store, &sampler);
        let shrunk = store.get(42).unwrap().adjusted_dl_rate;
        assert!(shrunk < TARGET);

        // retarget to 200 KB/s: the controller starts over from the new
        // target instead of scaling the stale adjustment
        store.put(42, adaptive_dl_rule(200));
        feed(&mut sampler, 42, 150.0 * 1024.0);
        controller.tick(&store, &sampler);
        let rule = store.get(42).unwrap();
        assert!(rule.adjusted_dl_rate > shrunk);
        assert!(rule.adjusted_dl_rate <= 200.0 * 1024.0);
    }

    #[test]
    fn test_tick_drops_state_when_adaptive_turned_off() {
        let (store, mut sampler) = fixture();
        store.put(42, adaptive_dl_rule(100));
        feed(&mut sampler, 42, TARGET * 2.0);

        let mut controller = AdaptiveController::new();
        controller.tick(&store, &sampler);
        assert!(!controller.streams.is_empty());

        let mut plain = adaptive_dl_rule(100);
        plain.adaptive = false;
        store.put(42, plain);
        controller.tick(&store, &sampler);
        assert!(controller.streams.is_empty());
    }

    #[test]
    fn test_tick_drives_global_rule() {
        let (store, mut sampler) = fixture();
        let mut global = adaptive_dl_rule(100);
        global.limit_upload = true;
        global.upload_kbps = 100;
        store.set_global(global);
        feed(&mut sampler, 1, TARGET * 1.5);

        let mut controller = AdaptiveController::new();
        controller.tick(&store, &sampler);

        let global = store.get_global();
        assert!(global.adjusted_dl_rate > 0.0);
        assert!(global.adjusted_dl_rate < TARGET);
        // upload saw no traffic and held at the target
        assert_eq!(global.adjusted_ul_rate, TARGET);
    }
}
