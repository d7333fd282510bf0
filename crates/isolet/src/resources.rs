//! Self-imposed rlimits and usage sampling for the worker process.

use crate::bridge::protocol::{CpuUsage, MemoryUsage};
use crate::config::ResourceLimits;

/// Applies the heap and stack ceilings to the current process.
#[cfg(unix)]
pub fn apply_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::Resource;

    lower_limit(Resource::RLIMIT_DATA, limits.heap_bytes())?;
    lower_limit(Resource::RLIMIT_STACK, limits.stack_bytes())?;
    tracing::debug!(
        heap_bytes = limits.heap_bytes(),
        stack_bytes = limits.stack_bytes(),
        "Resource limits applied"
    );
    Ok(())
}

#[cfg(unix)]
fn lower_limit(resource: nix::sys::resource::Resource, bytes: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource).map_err(std::io::Error::from)?;
    setrlimit(resource, bytes.min(hard as u64) as _, hard).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn apply_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    tracing::warn!(?limits, "Resource limits are not supported on this platform");
    Ok(())
}

/// Turns cumulative rusage into per-period deltas.
#[derive(Debug, Default)]
pub struct UsageSampler {
    last_user: u64,
    last_system: u64,
}

impl UsageSampler {
    /// Starts counting from the current totals.
    pub fn new() -> Self {
        let mut sampler = Self::default();
        sampler.sample();
        sampler
    }

    /// CPU time spent since the previous sample, and current memory readings.
    pub fn sample(&mut self) -> (CpuUsage, MemoryUsage) {
        let (user, system, max_rss) = read_rusage();
        let cpu = CpuUsage {
            user: user.saturating_sub(self.last_user),
            system: system.saturating_sub(self.last_system),
        };
        self.last_user = user;
        self.last_system = system;
        (cpu, read_memory(max_rss))
    }
}

/// Cumulative user and system time in microseconds, and peak RSS in bytes.
#[cfg(unix)]
fn read_rusage() -> (u64, u64, u64) {
    use nix::sys::resource::{UsageWho, getrusage};
    use nix::sys::time::TimeVal;

    fn micros(t: TimeVal) -> u64 {
        (t.tv_sec().max(0) as u64) * 1_000_000 + t.tv_usec().max(0) as u64
    }

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;
            // Linux reports kilobytes, macOS bytes.
            let max_rss = if cfg!(target_os = "macos") {
                max_rss
            } else {
                max_rss * 1024
            };
            (micros(usage.user_time()), micros(usage.system_time()), max_rss)
        }
        Err(e) => {
            tracing::warn!(error = %e, "getrusage failed");
            (0, 0, 0)
        }
    }
}

#[cfg(not(unix))]
fn read_rusage() -> (u64, u64, u64) {
    (0, 0, 0)
}

/// `rss` is the current resident set; `maxRss` the peak. `data` is the data segment
/// that `RLIMIT_DATA` caps.
#[cfg(target_os = "linux")]
fn read_memory(max_rss: u64) -> MemoryUsage {
    match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => match parse_statm(&statm, page_size()) {
            Some((rss, data)) => MemoryUsage::new(rss)
                .with("maxRss", max_rss)
                .with("data", data),
            None => {
                tracing::warn!(%statm, "Unreadable /proc/self/statm");
                MemoryUsage::new(max_rss).with("maxRss", max_rss)
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Could not read /proc/self/statm");
            MemoryUsage::new(max_rss).with("maxRss", max_rss)
        }
    }
}

/// Without a cheap current reading the peak stands in for `rss`.
#[cfg(not(target_os = "linux"))]
fn read_memory(max_rss: u64) -> MemoryUsage {
    MemoryUsage::new(max_rss).with("maxRss", max_rss)
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use nix::unistd::{SysconfVar, sysconf};

    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

/// Resident and data sizes in bytes from the `size resident shared text lib data dt`
/// page counts of `statm`.
#[cfg(any(target_os = "linux", test))]
fn parse_statm(statm: &str, page_size: u64) -> Option<(u64, u64)> {
    let fields: Vec<u64> = statm
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    let resident = *fields.get(1)?;
    let data = *fields.get(5)?;
    Some((resident * page_size, data * page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_deltas() {
        let mut sampler = UsageSampler::new();
        let mut spin = 0u64;
        for i in 0..2_000_000u64 {
            spin = spin.wrapping_add(i * i);
        }
        std::hint::black_box(spin);
        let (first, memory) = sampler.sample();
        let (second, _) = sampler.sample();
        assert!(second.user <= first.user + 10_000);
        if cfg!(unix) {
            assert!(memory.rss > 0);
            assert!(memory.get("maxRss").is_some());
        }
    }

    #[test]
    fn statm_pages_become_bytes() {
        let statm = "6245 1503 1024 220 0 2400 0\n";
        assert_eq!(parse_statm(statm, 4096), Some((1503 * 4096, 2400 * 4096)));
        assert_eq!(parse_statm("12 x", 4096), None);
        assert_eq!(parse_statm("12", 4096), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_tracks_current_usage_not_the_peak() {
        let mut sampler = UsageSampler::new();
        {
            let mut block = vec![0u8; 64 * 1024 * 1024];
            for page in block.chunks_mut(4096) {
                page[0] = 1;
            }
            std::hint::black_box(&block);
        }
        let (_, memory) = sampler.sample();
        let peak = memory.get("maxRss").unwrap();
        assert!(peak >= 64 * 1024 * 1024);
        assert!(memory.rss < peak);
        assert!(memory.get("data").is_some());
    }
}
