// Per-process and global bandwidth policy

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketMap;

/// Traffic direction as seen from the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

/// Bandwidth policy for one process, or (unscoped) for the whole host.
///
/// Configured limits are in KB/s. The `adjusted_*` fields hold rates in
/// bytes/sec written back by the adaptive controller; when `adaptive` is set
/// and an adjusted rate is warmed up, enforcement uses it in preference to
/// the configured limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub block_all: bool,
    pub limit_download: bool,
    pub download_kbps: u32,
    pub limit_upload: bool,
    pub upload_kbps: u32,
    pub adaptive: bool,
    #[serde(skip)]
    pub adjusted_dl_rate: f64,
    #[serde(skip)]
    pub adjusted_ul_rate: f64,
}

impl Rule {
    /// Whether this rule has any effect. Rules without effect never occupy
    /// space in the store.
    pub fn has_any_rule(&self) -> bool {
        self.block_all
            || (self.limit_download && self.download_kbps > 0)
            || (self.limit_upload && self.upload_kbps > 0)
    }

    /// Whether `dir` is rate-limited by this rule.
    pub fn limits(&self, dir: Direction) -> bool {
        match dir {
            Direction::Download => self.limit_download && self.download_kbps > 0,
            Direction::Upload => self.limit_upload && self.upload_kbps > 0,
        }
    }

    /// Configured target rate for `dir` in bytes/sec.
    pub fn target_rate(&self, dir: Direction) -> f64 {
        match dir {
            Direction::Download => self.download_kbps as f64 * 1024.0,
            Direction::Upload => self.upload_kbps as f64 * 1024.0,
        }
    }

    /// Adaptive adjusted rate for `dir` in bytes/sec (0 until the
    /// controller has produced one).
    pub fn adjusted(&self, dir: Direction) -> f64 {
        match dir {
            Direction::Download => self.adjusted_dl_rate,
            Direction::Upload => self.adjusted_ul_rate,
        }
    }

    pub fn set_adjusted(&mut self, dir: Direction, rate: f64) {
        match dir {
            Direction::Download => self.adjusted_dl_rate = rate,
            Direction::Upload => self.adjusted_ul_rate = rate,
        }
    }

    /// Enforcement rate in bytes/sec for `dir`, or None when the direction
    /// is unlimited.
    pub fn effective_rate(&self, dir: Direction) -> Option<f64> {
        if !self.limits(dir) {
            return None;
        }
        let adjusted = self.adjusted(dir);
        if self.adaptive && adjusted > 0.0 {
            Some(adjusted)
        } else {
            Some(self.target_rate(dir))
        }
    }
}

/// Authoritative rule storage: one rule per governed PID plus the singleton
/// global rule. Lookups on the packet path run concurrently with control
/// mutations; a packet in flight may see either the old or the new rule.
pub struct RuleStore {
    rules: DashMap<u32, Rule>,
    global: RwLock<Rule>,
    buckets: Arc<BucketMap>,
}

impl RuleStore {
    pub fn new(buckets: Arc<BucketMap>) -> Self {
        Self {
            rules: DashMap::new(),
            global: RwLock::new(Rule::default()),
            buckets,
        }
    }

    /// Insert or replace the rule for `pid`. A rule with no effect removes
    /// the entry instead and tears down the PID's token buckets.
    pub fn put(&self, pid: u32, rule: Rule) {
        if rule.has_any_rule() {
            self.rules.insert(pid, rule);
        } else {
            self.rules.remove(&pid);
            self.buckets.remove_pid(pid);
        }
    }

    /// Apply one rule to several PIDs (each gets its own copy).
    pub fn put_many(&self, pids: &[u32], rule: &Rule) {
        for &pid in pids {
            self.put(pid, rule.clone());
        }
    }

    pub fn get(&self, pid: u32) -> Option<Rule> {
        self.rules.get(&pid).map(|r| r.clone())
    }

    pub fn set_global(&self, rule: Rule) {
        *self.global.write().unwrap() = rule;
    }

    pub fn get_global(&self) -> Rule {
        self.global.read().unwrap().clone()
    }

    /// PIDs with a configured rule.
    pub fn pids(&self) -> Vec<u32> {
        self.rules.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of every per-PID rule. Entry-consistent, not
    /// cross-entry-consistent; callers iterate at control cadence.
    pub fn entries(&self) -> Vec<(u32, Rule)> {
        self.rules
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Write an adaptive adjusted rate into the rule for `pid`.
    pub(crate) fn set_adjusted(&self, pid: u32, dir: Direction, rate: f64) {
        if let Some(mut rule) = self.rules.get_mut(&pid) {
            rule.set_adjusted(dir, rate);
        }
    }

    /// Write an adaptive adjusted rate into the global rule.
    pub(crate) fn set_global_adjusted(&self, dir: Direction, rate: f64) {
        self.global.write().unwrap().set_adjusted(dir, rate);
    }
}
