//! Memory budgeting for out-of-core shuffles.

/// Portion of physical memory usable for staging, as a safety margin against
/// other process and OS memory pressure: 8/10.
const USABLE_NUM: u64 = 8;
const USABLE_DEN: u64 = 10;

/// Resolved shuffle plan: number of interleaved passes and the in-memory
/// staging budget. A zero budget means no buffering, stream directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlan {
    pub interleave: u64,
    pub budget: u64,
}

/// Resolves the interleaving factor and staging budget for a shuffle run.
///
/// `requested` is the interleaving factor from the command line: 0 for auto,
/// 1 for a plain single pass, greater for a fixed pass count. In auto mode
/// the factor guarantees each pass's working set fits the budget; when the
/// physical memory size is unknown the plan degrades to a buffer-less single
/// pass even though it may exceed memory.
pub fn plan_buffer(total_input_bytes: u64, physical_memory: u64, requested: u64) -> BufferPlan {
    if requested == 1 {
        return BufferPlan {
            interleave: 1,
            budget: 0,
        };
    }

    let budget = physical_memory / USABLE_DEN * USABLE_NUM;

    let interleave = if requested > 1 {
        requested
    } else if budget == 0 {
        1
    } else {
        ((total_input_bytes + budget - 1) / budget).max(1)
    };

    return BufferPlan { interleave, budget };
}

/// Physical memory size in bytes, 0 when it cannot be discovered.
pub fn physical_memory_size() -> u64 {
    #[cfg(target_os = "linux")]
    {
        return std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_meminfo_total(&contents))
            .unwrap_or(0);
    }
    #[cfg(not(target_os = "linux"))]
    {
        return 0;
    }
}

/// Extracts `MemTotal` from `/proc/meminfo` contents.
#[allow(dead_code)]
fn parse_meminfo_total(contents: &str) -> Option<u64> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kilobytes: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kilobytes * 1024);
        }
    }
    return None;
}
