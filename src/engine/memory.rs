//! Shared-resource headroom probing for admission control.

/// Reports the fraction of a finite shared resource that is still free.
///
/// `None` means the resource cannot be measured on this host; admission
/// control treats that as unconstrained.
pub trait MemoryProbe: Send + Sync {
    fn headroom(&self) -> Option<f64>;
}

/// System memory probe. On Linux this reads /proc/meminfo; elsewhere the
/// headroom is unknown.
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn headroom(&self) -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = None;
        let mut available_kb = None;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = parse_kb(rest);
            }
        }
        let total = total_kb?;
        if total == 0 {
            return None;
        }
        Some(available_kb? as f64 / total as f64)
    }

    #[cfg(not(target_os = "linux"))]
    fn headroom(&self) -> Option<f64> {
        None
    }
}

#[cfg(target_os = "linux")]
fn parse_kb(rest: &str) -> Option<u64> {
    rest.trim().trim_end_matches("kB").trim().parse().ok()
}

/// A fixed probe for tests and for deployments that pin the policy.
pub struct FixedProbe(pub Option<f64>);

impl MemoryProbe for FixedProbe {
    fn headroom(&self) -> Option<f64> {
        self.0
    }
}
