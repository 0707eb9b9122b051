//! CPU/memory resource sampling (C7): reads `/proc/<pid>/stat` and
//! `/proc/<pid>/status` once per tick for each running module, grounded on
//! `original_source/supervisor.c`'s `update_module_cpu_usage` (reads
//! `/proc/<pid>/stat`) and `update_module_mem_usage` (reads
//! `/proc/<pid>/status`), both called every scheduler tick.
//!
//! `/proc/<pid>/stat`'s `utime`/`stime` fields are cumulative clock ticks
//! since the process started, not an instantaneous rate; the caller is
//! responsible for turning two samples into a percentage (see
//! `scheduler::Scheduler::sample_resource_usage`).

use std::fs;
use std::io;

/// One `/proc` sample for a single PID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawUsage {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub vmsize_kib: u64,
}

/// Clock ticks per second (`sysconf(_SC_CLK_TCK)`), used to convert the
/// tick counters in `/proc/<pid>/stat` into seconds.
pub fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Sample `/proc/<pid>/stat` and `/proc/<pid>/status` for one module.
pub fn sample(pid: u32) -> io::Result<RawUsage> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let (utime_ticks, stime_ticks) = parse_stat(&stat)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/<pid>/stat"))?;
    let status = fs::read_to_string(format!("/proc/{pid}/status"))?;
    let vmsize_kib = parse_vmsize_kib(&status).unwrap_or(0);
    Ok(RawUsage {
        utime_ticks,
        stime_ticks,
        vmsize_kib,
    })
}

/// Extract `(utime, stime)` from a `/proc/<pid>/stat` line. The process
/// name (field 2) is parenthesised and may itself contain spaces or
/// parens, so the remaining fields are found relative to the last `)`
/// rather than by a naive whitespace split.
fn parse_stat(stat: &str) -> Option<(u64, u64)> {
    let close_paren = stat.rfind(')')?;
    let rest = stat.get(close_paren + 1..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Field 3 (`state`) is `fields[0]`; utime is field 14 -> fields[11],
    // stime is field 15 -> fields[12].
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    Some((utime, stime))
}

/// Extract the `VmSize:` line (in KiB) from a `/proc/<pid>/status` dump.
fn parse_vmsize_kib(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmSize:")?;
        rest.trim().split_whitespace().next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_fields_with_parenthesised_comm() {
        let stat = "1234 (my proc) S 1 1234 1234 0 -1 4194304 100 0 0 0 55 17 0 0 20 0 4 0 123 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let (utime, stime) = parse_stat(stat).unwrap();
        assert_eq!(utime, 55);
        assert_eq!(stime, 17);
    }

    #[test]
    fn parses_vmsize_from_status() {
        let status = "Name:\tmy proc\nVmPeak:\t   10240 kB\nVmSize:\t    8192 kB\nVmRSS:\t 4096 kB\n";
        assert_eq!(parse_vmsize_kib(status), Some(8192));
    }

    #[test]
    fn sample_self_returns_nonzero_vmsize() {
        let pid = std::process::id();
        let usage = sample(pid).expect("reading /proc for the current process should succeed");
        assert!(usage.vmsize_kib > 0);
    }
}
