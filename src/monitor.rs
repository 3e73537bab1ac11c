//! Host resource sampling for the adaptive controller.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// Sample current cpu and memory utilization. On Linux this reads
/// `/proc`; elsewhere neutral mid-range values are reported so the
/// controller's success-rate signal still works.
pub async fn sample() -> ResourceSample {
    ResourceSample {
        cpu_percent: cpu_percent().await,
        mem_percent: mem_percent(),
    }
}

#[cfg(target_os = "linux")]
fn mem_percent() -> f64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 45.0;
    };

    let mut mem_total = 0u64;
    let mut mem_available = 0u64;
    for line in meminfo.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            match parts[0] {
                "MemTotal:" => mem_total = parts[1].parse().unwrap_or(0),
                "MemAvailable:" => mem_available = parts[1].parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    if mem_total == 0 {
        return 45.0;
    }
    let used = mem_total.saturating_sub(mem_available);
    (used as f64 / mem_total as f64) * 100.0
}

#[cfg(not(target_os = "linux"))]
fn mem_percent() -> f64 {
    45.0
}

#[cfg(target_os = "linux")]
async fn cpu_percent() -> f64 {
    fn busy_total(stat: &str) -> Option<(u64, u64)> {
        let line = stat.lines().next()?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || parts[0] != "cpu" {
            return None;
        }
        let user: u64 = parts[1].parse().ok()?;
        let nice: u64 = parts[2].parse().ok()?;
        let system: u64 = parts[3].parse().ok()?;
        let idle: u64 = parts[4].parse().ok()?;
        let busy = user + nice + system;
        Some((busy, busy + idle))
    }

    let Ok(first) = std::fs::read_to_string("/proc/stat") else {
        return 25.0;
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let Ok(second) = std::fs::read_to_string("/proc/stat") else {
        return 25.0;
    };

    match (busy_total(&first), busy_total(&second)) {
        (Some((busy1, total1)), Some((busy2, total2))) => {
            let busy_delta = busy2.saturating_sub(busy1);
            let total_delta = total2.saturating_sub(total1);
            if total_delta == 0 {
                25.0
            } else {
                (busy_delta as f64 / total_delta as f64) * 100.0
            }
        }
        _ => 25.0,
    }
}

#[cfg(not(target_os = "linux"))]
async fn cpu_percent() -> f64 {
    25.0
}
