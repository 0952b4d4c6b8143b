use std::fs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sandbox::EnvironmentHandle;

/// Aggregate usage of a process group at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub cpu_time: Duration,
    pub rss_bytes: u64,
}

/// Aggregates over the life of one execution
///
/// `peak_memory` is the largest `rss_bytes` seen and `cpu_time` never goes
/// backwards, even when processes of the group exit between samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub cpu_time: Duration,
    pub peak_memory: u64,
    pub samples: u64,
}

impl UsageSnapshot {
    fn record(&mut self, sample: UsageSample) {
        self.cpu_time = self.cpu_time.max(sample.cpu_time);
        self.peak_memory = self.peak_memory.max(sample.rss_bytes);
        self.samples += 1;
    }

    pub fn memory_mb(&self) -> f64 {
        self.peak_memory as f64 / (1024.0 * 1024.0)
    }

    pub fn cpu_seconds(&self) -> f64 {
        self.cpu_time.as_secs_f64()
    }
}

/// Source of usage samples for a process group
pub trait UsageProbe: Send + Sync {
    /// Returns `None` when no process of the group could be read
    fn sample(&self, pgid: i32) -> Option<UsageSample>;
}

/// Reads `/proc/<pid>/stat` of every process in the group
pub struct ProcfsProbe {
    ticks_per_second: u64,
    page_size: u64,
}

impl ProcfsProbe {
    pub fn new() -> Self {
        // SAFETY: sysconf only reads system configuration values
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            ticks_per_second: if ticks > 0 { ticks as u64 } else { 100 },
            page_size: if page > 0 { page as u64 } else { 4096 },
        }
    }
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields of `/proc/<pid>/stat` the probe cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pgrp: i32,
    /// utime + stime + cutime + cstime, in clock ticks
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Parses one stat line; the command name may contain spaces and parentheses
fn parse_stat(line: &str) -> Option<ProcStat> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state, so field N of proc(5) sits at index N - 3
    let field = |i: usize| fields.get(i).and_then(|f| f.parse::<i64>().ok());

    let cpu_ticks = [11, 12, 13, 14]
        .into_iter()
        .map(|i| field(i).map(|v| v.max(0) as u64))
        .sum::<Option<u64>>()?;

    Some(ProcStat {
        pgrp: field(2)? as i32,
        cpu_ticks,
        rss_pages: field(21)?.max(0) as u64,
    })
}

impl UsageProbe for ProcfsProbe {
    fn sample(&self, pgid: i32) -> Option<UsageSample> {
        let entries = fs::read_dir("/proc").ok()?;

        let mut ticks = 0u64;
        let mut pages = 0u64;
        let mut found = false;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes may vanish between listing and reading
            let Ok(line) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            let Some(stat) = parse_stat(&line) else {
                continue;
            };
            if stat.pgrp == pgid {
                found = true;
                ticks += stat.cpu_ticks;
                pages += stat.rss_pages;
            }
        }

        found.then(|| UsageSample {
            cpu_time: Duration::from_micros(ticks * 1_000_000 / self.ticks_per_second),
            rss_bytes: pages * self.page_size,
        })
    }
}

/// Spawns periodic samplers for running sandboxes
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn UsageProbe>,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn UsageProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn procfs(interval: Duration) -> Self {
        Self::new(Arc::new(ProcfsProbe::new()), interval)
    }

    /// Starts sampling the process group recorded on `handle`
    ///
    /// Sampling runs on its own task and reads `/proc` on the blocking pool, so
    /// it never stalls the runner waiting on the process.
    pub fn attach(&self, handle: &Arc<EnvironmentHandle>) -> MonitorHandle {
        let usage = Arc::new(Mutex::new(UsageSnapshot::default()));
        let token = CancellationToken::new();

        let task = tokio::spawn(sample_loop(
            self.probe.clone(),
            handle.clone(),
            self.interval,
            usage.clone(),
            token.clone(),
        ));

        MonitorHandle { usage, token, task }
    }
}

async fn sample_loop(
    probe: Arc<dyn UsageProbe>,
    handle: Arc<EnvironmentHandle>,
    interval: Duration,
    usage: Arc<Mutex<UsageSnapshot>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pgid) = handle.process_group() else {
            continue;
        };
        let probe = probe.clone();
        let sample = match tokio::task::spawn_blocking(move || probe.sample(pgid)).await {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("Usage probe for sandbox {} failed: {e}", handle.id());
                None
            }
        };
        if let Some(sample) = sample {
            usage.lock().record(sample);
        }
    }
}

/// A running sampler; dropping it without `detach` stops sampling as well
pub struct MonitorHandle {
    usage: Arc<Mutex<UsageSnapshot>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Most recent aggregates
    pub fn snapshot(&self) -> UsageSnapshot {
        *self.usage.lock()
    }

    /// Stops sampling and returns the final aggregates
    ///
    /// Zero when the process ended before the first sample.
    pub async fn detach(mut self) -> UsageSnapshot {
        self.token.cancel();
        if let Err(e) = (&mut self.task).await {
            log::warn!("Usage sampler ended abnormally: {e}");
        }
        *self.usage.lock()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
