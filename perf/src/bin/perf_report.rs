use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use shale_perf::*;
use shale_topic::{MismatchPolicy, Topic, TopicLayout};

const BATCHES: usize = 200;
const BATCH_SIZE: usize = 1_000;
const WARMUP: usize = 20;

const MSG_SIZES: [u32; 4] = [16, 256, 4096, 65536];
const SLOT_COUNTS: [u32; 3] = [2, 16, 256];

const CONTENDED_OPS: u64 = 200_000;

#[derive(Debug, Clone, serde::Serialize)]
struct ContendedRun {
    publishers: usize,
    subscribers: usize,
    ops_per_thread: u64,
    publish_rate: f64,
    receive_rate: f64,
    elapsed_ns: u128,
}

fn main() {
    let rusage_start = capture_rusage(libc::RUSAGE_SELF);
    let mut results: Vec<BenchResult> = Vec::new();

    print_banner();
    section_layout();
    section_by_msg_size(&mut results);
    section_by_slot_count(&mut results);
    let contended = section_contended();

    let usage = capture_rusage(libc::RUSAGE_SELF).since(&rusage_start);
    section_resources(&usage);
    save_results(&results, &contended, &usage);
}

fn print_banner() {
    let bar = "\u{2550}".repeat(90);
    println!("\n{bar}");
    println!("  SHALE PERFORMANCE REPORT");
    println!("  single-thread publish/receive + contended threads");
    println!("{bar}\n");

    let ncpu = thread::available_parallelism().map(|n| n.get()).unwrap_or(0);
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    println!("  CPUs:      {ncpu}");
    println!("  Page size: {}", format_bytes(page.max(0) as u64));
}

fn section_layout() {
    section_header("SEGMENT SIZES");
    println!("  {:<12} {:>8} {:>14}", "msg_size", "slots", "segment");
    for &msg_size in &MSG_SIZES {
        for &slots in &SLOT_COUNTS {
            if let Ok(layout) = TopicLayout::new(msg_size, slots) {
                println!(
                    "  {:<12} {:>8} {:>14}",
                    msg_size,
                    slots,
                    format_bytes(layout.total_bytes() as u64)
                );
            }
        }
    }
}

fn section_by_msg_size(results: &mut Vec<BenchResult>) {
    section_header("SINGLE THREAD BY PAYLOAD SIZE (16 slots)");
    print_table_header();

    for &msg_size in &MSG_SIZES {
        let publisher = bench_topic(&format!("size{msg_size}"), msg_size, 16);
        let mut subscriber =
            Topic::attach_only(publisher.name(), msg_size, 16, MismatchPolicy::Reject)
                .expect("attach failed");
        let payload = make_payload(msg_size);
        let mut out = vec![0u8; msg_size as usize];

        let publish = measure_batched(
            &format!("publish/{msg_size}B"),
            BATCHES,
            BATCH_SIZE,
            WARMUP,
            || publisher.publish(black_box(&payload)).expect("publish failed"),
        );
        print_result_row(&publish);
        results.push(publish);

        let receive = measure_batched(
            &format!("receive/{msg_size}B"),
            BATCHES,
            BATCH_SIZE,
            WARMUP,
            || {
                subscriber.receive(&mut out).expect("receive failed");
                black_box(&out);
            },
        );
        print_result_row(&receive);
        results.push(receive);

        drop(subscriber);
        let _ = publisher.remove_self();
    }
}

fn section_by_slot_count(results: &mut Vec<BenchResult>) {
    section_header("ROUND TRIP BY SLOT COUNT (64 B)");
    print_table_header();

    for &slots in &SLOT_COUNTS {
        let publisher = bench_topic(&format!("slots{slots}"), 64, slots);
        let mut subscriber = Topic::attach_any(publisher.name())
            .expect("attach failed");
        let payload = make_payload(64);
        let mut out = [0u8; 64];

        let result = measure_batched(
            &format!("round_trip/{slots}_slots"),
            BATCHES,
            BATCH_SIZE,
            WARMUP,
            || {
                publisher.publish(black_box(&payload)).expect("publish failed");
                subscriber.receive(&mut out).expect("receive failed");
                black_box(&out);
            },
        );
        print_result_row(&result);
        results.push(result);

        drop(subscriber);
        let _ = publisher.remove_self();
    }
}

/// Publisher and subscriber threads on their own handles, all running at
/// once against an 8-slot topic.
fn section_contended() -> Vec<ContendedRun> {
    section_header("CONTENDED THREADS (64 B, 8 slots)");
    println!(
        "  {:<12} {:>12} {:>14} {:>14}",
        "pub x sub", "ops/thread", "publish", "receive"
    );
    println!("  {}", "─".repeat(60));

    let mut runs = Vec::new();
    for (publishers, subscribers) in [(1, 1), (1, 4), (4, 1), (4, 4)] {
        let owner = bench_topic(&format!("contended{publishers}x{subscribers}"), 64, 8);
        let run = contended_run(owner.name(), publishers, subscribers);
        println!(
            "  {:<12} {:>12} {:>14} {:>14}",
            format!("{publishers} x {subscribers}"),
            run.ops_per_thread,
            format_rate(run.publish_rate),
            format_rate(run.receive_rate),
        );
        runs.push(run);
        let _ = owner.remove_self();
    }
    runs
}

fn contended_run(name: &str, publishers: usize, subscribers: usize) -> ContendedRun {
    let start_line = Arc::new(Barrier::new(publishers + subscribers + 1));
    let mut handles = Vec::new();

    for role in std::iter::repeat_n(true, publishers).chain(std::iter::repeat_n(false, subscribers))
    {
        let name = name.to_string();
        let start_line = Arc::clone(&start_line);
        handles.push(thread::spawn(move || {
            let mut topic =
                Topic::attach_any(&name).expect("attach failed");
            let mut buf = make_payload(64);
            start_line.wait();
            let start = Instant::now();
            for _ in 0..CONTENDED_OPS {
                if role {
                    topic.publish(&buf).expect("publish failed");
                } else {
                    topic.receive(&mut buf).expect("receive failed");
                }
            }
            (role, start.elapsed())
        }));
    }

    start_line.wait();
    let wall = Instant::now();
    let mut publish_secs = 0.0;
    let mut receive_secs = 0.0;
    for handle in handles {
        let (role, elapsed) = handle.join().expect("bench thread panicked");
        if role {
            publish_secs += elapsed.as_secs_f64();
        } else {
            receive_secs += elapsed.as_secs_f64();
        }
    }
    let elapsed_ns = wall.elapsed().as_nanos();

    // Aggregate rate: total operations over the mean per-thread time.
    let rate = |threads: usize, secs: f64| {
        if secs > 0.0 {
            (threads as f64 * CONTENDED_OPS as f64) / (secs / threads as f64)
        } else {
            0.0
        }
    };
    ContendedRun {
        publishers,
        subscribers,
        ops_per_thread: CONTENDED_OPS,
        publish_rate: rate(publishers, publish_secs),
        receive_rate: rate(subscribers, receive_secs),
        elapsed_ns,
    }
}

fn section_resources(usage: &ResourceSnapshot) {
    section_header("RESOURCE USAGE");
    println!(
        "  Peak RSS:                    {}",
        format_bytes(usage.max_rss_bytes.max(0) as u64)
    );
    println!("  Minor page faults:           {}", usage.minor_faults);
    println!("  Major page faults:           {}", usage.major_faults);
    println!("  Voluntary ctx switches:      {}", usage.vol_ctx_switches);
    println!("  Involuntary ctx switches:    {}", usage.invol_ctx_switches);
    println!(
        "  User CPU time:               {:.3}s",
        usage.user_time_us as f64 / 1e6
    );
    println!(
        "  System CPU time:             {:.3}s",
        usage.sys_time_us as f64 / 1e6
    );
}

fn save_results(results: &[BenchResult], contended: &[ContendedRun], usage: &ResourceSnapshot) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_report.json");

    let output = serde_json::json!({
        "report_type": "topic",
        "timestamp": timestamp,
        "single_thread": results,
        "contended": contended,
        "resources": usage,
    });

    let bar = "\u{2550}".repeat(90);
    let written = serde_json::to_string_pretty(&output)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(&json_path, json));
    match written {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}
