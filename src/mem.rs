use std::fs;

/// One gigabyte, for log formatting.
pub const GB: u64 = 0x4000_0000;

/// Fraction of total system memory handed to the scaffolder as its budget.
const BUDGET_FRACTION: f64 = 0.85;

/// Total system memory in bytes, or `None` when it cannot be determined
/// (non-Linux hosts, restricted /proc).
pub fn total_ram() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Derive the RSS budget from total system memory. `None` means the limit
/// could not be measured; callers treat that as unlimited.
pub fn ram_limit() -> (Option<u64>, Option<u64>) {
    match total_ram() {
        Some(total) => (Some(total), Some((total as f64 * BUDGET_FRACTION) as u64)),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn total_ram_is_positive_on_linux() {
        let total = total_ram().expect("meminfo readable");
        assert!(total > 0);
        let (_, limit) = ram_limit();
        assert!(limit.unwrap() < total);
    }
}
