use shale_topic::Topic;
use std::time::Instant;

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: String,
    pub stats: Stats,
}

/// Sorts `samples` in place and summarizes them. Panics on an empty slice.
pub fn compute_stats(samples: &mut [u64]) -> Stats {
    assert!(!samples.is_empty(), "cannot compute stats on empty samples");
    samples.sort_unstable();

    let count = samples.len();
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / count as f64;
    let variance = samples
        .iter()
        .map(|&x| (x as f64 - mean).powi(2))
        .sum::<f64>()
        / count as f64;

    Stats {
        min: samples[0],
        max: samples[count - 1],
        mean,
        stddev: variance.sqrt(),
        p50: percentile_sorted(samples, 50.0),
        p90: percentile_sorted(samples, 90.0),
        p99: percentile_sorted(samples, 99.0),
        p999: percentile_sorted(samples, 99.9),
        count,
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile_sorted(sorted: &[u64], pct: f64) -> u64 {
    let len = sorted.len();
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(len - 1)]
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Runs `f` in `batches` timed batches of `batch_size` calls after
/// `warmup` untimed batches; each sample is the mean ns per call of a batch.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    warmup: usize,
    mut f: F,
) -> BenchResult {
    for _ in 0..warmup * batch_size {
        f();
    }

    let mut samples = Vec::with_capacity(batches);
    for _ in 0..batches {
        let start = Instant::now();
        for _ in 0..batch_size {
            f();
        }
        let per_op = start.elapsed().as_nanos() / batch_size.max(1) as u128;
        samples.push((per_op as u64).max(1));
    }

    BenchResult {
        name: name.to_string(),
        unit: "ns/op".to_string(),
        stats: compute_stats(&mut samples),
    }
}

// ─── Resource Usage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSnapshot {
    pub max_rss_bytes: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub vol_ctx_switches: i64,
    pub invol_ctx_switches: i64,
    pub user_time_us: i64,
    pub sys_time_us: i64,
}

/// `getrusage` for the whole process (`RUSAGE_SELF`) or the calling
/// thread (`RUSAGE_THREAD`).
pub fn capture_rusage(who: libc::c_int) -> ResourceSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe { libc::getrusage(who, &mut usage) };
    ResourceSnapshot {
        max_rss_bytes: usage.ru_maxrss * 1024,
        minor_faults: usage.ru_minflt,
        major_faults: usage.ru_majflt,
        vol_ctx_switches: usage.ru_nvcsw,
        invol_ctx_switches: usage.ru_nivcsw,
        user_time_us: usage.ru_utime.tv_sec * 1_000_000 + usage.ru_utime.tv_usec,
        sys_time_us: usage.ru_stime.tv_sec * 1_000_000 + usage.ru_stime.tv_usec,
    }
}

impl ResourceSnapshot {
    /// Counters accumulated since `start`; peak RSS is taken from `self`.
    pub fn since(&self, start: &ResourceSnapshot) -> ResourceSnapshot {
        ResourceSnapshot {
            max_rss_bytes: self.max_rss_bytes,
            minor_faults: self.minor_faults.saturating_sub(start.minor_faults),
            major_faults: self.major_faults.saturating_sub(start.major_faults),
            vol_ctx_switches: self.vol_ctx_switches.saturating_sub(start.vol_ctx_switches),
            invol_ctx_switches: self
                .invol_ctx_switches
                .saturating_sub(start.invol_ctx_switches),
            user_time_us: self.user_time_us.saturating_sub(start.user_time_us),
            sys_time_us: self.sys_time_us.saturating_sub(start.sys_time_us),
        }
    }
}

// ─── Topics ─────────────────────────────────────────────────────────────────

pub fn temp_topic_name(label: &str) -> String {
    let pid = std::process::id();
    format!("/shale-bench-{label}-{pid}")
}

/// Creates a fresh topic for a benchmark, replacing any leftover of the
/// same name.
pub fn bench_topic(label: &str, msg_size: u32, msg_count: u32) -> Topic {
    let name = temp_topic_name(label);
    let _ = Topic::remove(&name);
    match Topic::create_or_fail(&name, msg_size, msg_count) {
        Ok(topic) => topic,
        Err(err) => panic!("failed to create bench topic {name}: {err}"),
    }
}

/// Payload of `msg_size` bytes with a recognizable pattern.
pub fn make_payload(msg_size: u32) -> Vec<u8> {
    (0..msg_size).map(|i| (i % 251) as u8).collect()
}

// ─── Formatting ─────────────────────────────────────────────────────────────

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub fn format_rate(ops_per_sec: f64) -> String {
    if ops_per_sec >= 1_000_000.0 {
        format!("{:.2}M/s", ops_per_sec / 1_000_000.0)
    } else if ops_per_sec >= 1_000.0 {
        format!("{:.1}K/s", ops_per_sec / 1_000.0)
    } else {
        format!("{ops_per_sec:.0}/s")
    }
}

pub fn print_table_header() {
    println!(
        "  {:<34} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  unit",
        "Benchmark", "min", "p50", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(96));
}

pub fn print_result_row(r: &BenchResult) {
    println!(
        "  {:<34} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
        r.name,
        r.stats.min,
        r.stats.p50,
        r.stats.p90,
        r.stats.p99,
        r.stats.p999,
        r.stats.max,
        r.unit,
    );
}

pub fn section_header(title: &str) {
    println!("\n{}", "─".repeat(90));
    println!("  {title}");
    println!("{}\n", "─".repeat(90));
}
