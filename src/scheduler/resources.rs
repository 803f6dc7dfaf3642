//! Resource usage of the checker process.

use regex::Regex;
use std::sync::OnceLock;

static PEAK_RSS: OnceLock<Regex> = OnceLock::new();

/// Peak resident set size in bytes, read from `/proc/self/status`.
/// `None` where procfs is unavailable.
pub fn peak_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_peak_memory(&status)
}

/// Extract `VmHWM` from a procfs status document.
pub fn parse_peak_memory(status: &str) -> Option<u64> {
    let re = PEAK_RSS.get_or_init(|| {
        Regex::new(r"(?m)^VmHWM:\s+(\d+)\s+kB").expect("static regex")
    });
    let kb: u64 = re.captures(status)?.get(1)?.as_str().parse().ok()?;
    Some(kb * 1024)
}

/// Peak memory as a percentage of `budget_bytes`.
pub fn memory_utilization(budget_bytes: u64) -> Option<f64> {
    if budget_bytes == 0 {
        return None;
    }
    peak_memory_bytes().map(|peak| peak as f64 / budget_bytes as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peak_memory() {
        let status = "Name:\tsitewatch\nVmPeak:\t  200000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";
        assert_eq!(parse_peak_memory(status), Some(2048 * 1024));
        assert_eq!(parse_peak_memory("Name:\tsitewatch\n"), None);
    }

    #[test]
    fn test_zero_budget() {
        assert_eq!(memory_utilization(0), None);
    }
}
