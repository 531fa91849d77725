// Rolling throughput windows

use std::collections::{HashMap, VecDeque};

use crate::rules::Direction;

/// Number of one-second samples averaged per stream.
pub const WINDOW_LEN: usize = 5;

/// Fixed-width rolling average of per-second throughput samples: one stream
/// per (PID, direction) plus the two host-wide streams. Streams that miss a
/// tick receive a zero sample so their average decays instead of going
/// stale; fully decayed streams are pruned.
#[derive(Default)]
pub struct SamplerWindow {
    per_pid: HashMap<(u32, Direction), VecDeque<f64>>,
    global_dl: VecDeque<f64>,
    global_ul: VecDeque<f64>,
}

impl SamplerWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick of measurements in bytes/sec.
    pub fn push_tick(&mut self, per_pid: &HashMap<u32, (f64, f64)>, global: (f64, f64)) {
        for (&pid, &(dl, ul)) in per_pid {
            push(self.per_pid.entry((pid, Direction::Download)).or_default(), dl);
            push(self.per_pid.entry((pid, Direction::Upload)).or_default(), ul);
        }

        self.per_pid.retain(|(pid, _), window| {
            if !per_pid.contains_key(pid) {
                push(window, 0.0);
            }
            window.iter().any(|&sample| sample > 0.0)
        });

        push(&mut self.global_dl, global.0);
        push(&mut self.global_ul, global.1);
    }

    /// Rolling average for one stream; 0 when the stream is unknown.
    pub fn average(&self, pid: u32, dir: Direction) -> f64 {
        self.per_pid.get(&(pid, dir)).map(avg).unwrap_or(0.0)
    }

    /// Rolling average of host-wide throughput for `dir`.
    pub fn global_average(&self, dir: Direction) -> f64 {
        match dir {
            Direction::Download => avg(&self.global_dl),
            Direction::Upload => avg(&self.global_ul),
        }
    }

    /// Per-PID rolling averages (dl, ul) for every tracked stream.
    pub fn process_averages(&self) -> HashMap<u32, (f64, f64)> {
        let mut averages: HashMap<u32, (f64, f64)> = HashMap::new();
        for (&(pid, dir), window) in &self.per_pid {
            let entry = averages.entry(pid).or_default();
            match dir {
                Direction::Download => entry.0 = avg(window),
                Direction::Upload => entry.1 = avg(window),
            }
        }
        averages
    }

    pub fn clear(&mut self) {
        self.per_pid.clear();
        self.global_dl.clear();
        self.global_ul.clear();
    }
}

fn push(window: &mut VecDeque<f64>, sample: f64) {
    window.push_back(sample);
    while window.len() > WINDOW_LEN {
        window.pop_front();
    }
}

fn avg(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(sampler: &mut SamplerWindow, pid: u32, dl: f64) {
        let mut rates = HashMap::new();
        rates.insert(pid, (dl, 0.0));
        sampler.push_tick(&rates, (dl, 0.0));
    }

    #[test]
    fn test_average_over_window() {
        let mut sampler = SamplerWindow::new();
        tick(&mut sampler, 42, 100.0);
        tick(&mut sampler, 42, 200.0);
        assert_eq!(sampler.average(42, Direction::Download), 150.0);
        assert_eq!(sampler.global_average(Direction::Download), 150.0);
    }

    #[test]
    fn test_window_trims_to_five_samples() {
        let mut sampler = SamplerWindow::new();
        for sample in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            tick(&mut sampler, 1, sample);
        }
        // only the newest five (3..=7) remain
        assert_eq!(sampler.average(1, Direction::Download), 5.0);
    }

    #[test]
    fn test_absent_pid_decays_to_zero_and_prunes() {
        let mut sampler = SamplerWindow::new();
        tick(&mut sampler, 7, 1000.0);
        assert_eq!(sampler.average(7, Direction::Download), 1000.0);

        let empty = HashMap::new();
        for _ in 0..WINDOW_LEN - 1 {
            sampler.push_tick(&empty, (0.0, 0.0));
            assert!(sampler.average(7, Direction::Download) > 0.0);
        }
        // the last nonzero sample ages out and the stream disappears
        sampler.push_tick(&empty, (0.0, 0.0));
        assert_eq!(sampler.average(7, Direction::Download), 0.0);
        assert!(sampler.process_averages().is_empty());
    }

    #[test]
    fn test_unknown_stream_reads_zero() {
        let sampler = SamplerWindow::new();
        assert_eq!(sampler.average(999, Direction::Upload), 0.0);
        assert_eq!(sampler.global_average(Direction::Upload), 0.0);
    }

    #[test]
    fn test_process_averages_carry_both_directions() {
        let mut sampler = SamplerWindow::new();
        let mut rates = HashMap::new();
        rates.insert(5, (300.0, 30.0));
        sampler.push_tick(&rates, (300.0, 30.0));
        assert_eq!(sampler.process_averages().get(&5), Some(&(300.0, 30.0)));
    }
}
