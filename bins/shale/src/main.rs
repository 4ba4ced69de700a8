//! `shale`: command-line access to shared-memory topics.
//!
//! ```text
//! shale create --name /ticks --msg-size 64 --msg-count 32
//! shale publish --count 100 --message hello
//! shale subscribe --count 10 --follow
//! shale measure --role pub --count 1000000 --create
//! shale info
//! shale remove
//! ```

mod interrupt;
mod payload;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use interrupt::Interrupt;
use shale_config::ShaleConfig;
use shale_topic::{Topic, TopicLayout};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shale")]
#[command(about = "Shared-memory publish/subscribe topics")]
struct Cli {
    #[command(flatten)]
    topic: TopicArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TopicArgs {
    /// TOML config file; flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Topic name, e.g. "/ticks"
    #[arg(long, global = true)]
    name: Option<String>,
    /// Payload size in bytes
    #[arg(long, global = true)]
    msg_size: Option<u32>,
    /// Number of slots in the ring
    #[arg(long, global = true)]
    msg_count: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the topic; fails if it already exists
    Create,
    /// Publish messages, creating the topic if needed
    Publish {
        #[arg(long, default_value_t = 1)]
        count: u64,
        /// Text payload (padded or truncated); defaults to the sequence number
        #[arg(long)]
        message: Option<String>,
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Receive and print messages
    Subscribe {
        #[arg(long, default_value_t = 1)]
        count: u64,
        /// Start at the writer's position instead of slot 0
        #[arg(long)]
        follow: bool,
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Time a run of publish or receive calls
    Measure {
        #[arg(long, value_enum)]
        role: Role,
        #[arg(long, default_value_t = 100_000)]
        count: u64,
        /// Create the topic first (fails if it exists)
        #[arg(long)]
        create: bool,
    },
    /// Print the geometry and writer position of an existing topic
    Info,
    /// Delete every kernel object of the topic
    Remove,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Pub,
    Sub,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli.topic)?;
    init_tracing(&config.log_level);

    let interrupt = Interrupt::install().context("failed to install signal handlers")?;
    let topic = &config.topic;
    tracing::debug!(
        name = %topic.name,
        msg_size = topic.msg_size,
        msg_count = topic.msg_count,
        "resolved topic settings"
    );

    match cli.command {
        Commands::Create => create(&config),
        Commands::Publish {
            count,
            message,
            interval_ms,
        } => publish(&config, count, message.as_deref(), interval_ms, interrupt),
        Commands::Subscribe {
            count,
            follow,
            interval_ms,
        } => subscribe(&config, count, follow, interval_ms, interrupt),
        Commands::Measure {
            role,
            count,
            create,
        } => measure(&config, role, count, create, interrupt),
        Commands::Info => info(&config),
        Commands::Remove => remove(&config),
    }
}

fn resolve_config(args: &TopicArgs) -> Result<ShaleConfig> {
    let mut config = match &args.config {
        Some(path) => ShaleConfig::load(path.display().to_string())
            .with_context(|| format!("loading {}", path.display()))?,
        None => ShaleConfig::default(),
    };
    if let Some(name) = &args.name {
        config.topic.name = name.clone();
    }
    if let Some(msg_size) = args.msg_size {
        config.topic.msg_size = msg_size;
    }
    if let Some(msg_count) = args.msg_count {
        config.topic.msg_count = msg_count;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn create(config: &ShaleConfig) -> Result<()> {
    let t = &config.topic;
    let topic = Topic::create_or_fail(&t.name, t.msg_size, t.msg_count)
        .with_context(|| format!("creating {}", t.name))?;
    println!(
        "created {}: {} slots of {} bytes",
        topic.name(),
        topic.msg_count(),
        topic.msg_size()
    );
    topic.close();
    Ok(())
}

fn publish(
    config: &ShaleConfig,
    count: u64,
    message: Option<&str>,
    interval_ms: u64,
    interrupt: Interrupt,
) -> Result<()> {
    let t = &config.topic;
    let topic = Topic::attach_or_create(&t.name, t.msg_size, t.msg_count)
        .with_context(|| format!("opening {}", t.name))?;
    let msg_size = topic.msg_size() as usize;

    let mut sent = 0u64;
    for seq in 0..count {
        if interrupt.is_set() {
            tracing::info!("interrupted");
            break;
        }
        topic
            .publish(&payload::build(msg_size, message, seq))
            .context("publish failed")?;
        sent += 1;
        pace(interval_ms);
    }
    println!("published {sent} message(s) to {}", topic.name());
    Ok(())
}

fn subscribe(
    config: &ShaleConfig,
    count: u64,
    follow: bool,
    interval_ms: u64,
    interrupt: Interrupt,
) -> Result<()> {
    let name = &config.topic.name;
    let mut topic = Topic::attach_any(name).with_context(|| format!("attaching {name}"))?;
    if follow {
        topic.follow_writer().context("reading writer cursor")?;
    }

    let mut out = vec![0u8; topic.msg_size() as usize];
    for _ in 0..count {
        if interrupt.is_set() {
            tracing::info!("interrupted");
            break;
        }
        let slot = topic.read_cursor();
        topic.receive(&mut out).context("receive failed")?;
        println!("[{slot}] {}", payload::render(&out));
        pace(interval_ms);
    }
    Ok(())
}

fn measure(
    config: &ShaleConfig,
    role: Role,
    count: u64,
    create: bool,
    interrupt: Interrupt,
) -> Result<()> {
    let t = &config.topic;
    let mut topic = match (create, role) {
        (true, _) => Topic::create_or_fail(&t.name, t.msg_size, t.msg_count),
        (false, Role::Pub) => Topic::attach_or_create(&t.name, t.msg_size, t.msg_count),
        (false, Role::Sub) => Topic::attach_any(&t.name),
    }
    .with_context(|| format!("opening {}", t.name))?;

    let mut buf = payload::build(topic.msg_size() as usize, None, 0);
    let mut done = 0u64;
    let start = Instant::now();
    while done < count && !interrupt.is_set() {
        match role {
            Role::Pub => topic.publish(&buf).context("publish failed")?,
            Role::Sub => topic.receive(&mut buf).context("receive failed")?,
        }
        done += 1;
    }
    let elapsed = start.elapsed();

    let label = match role {
        Role::Pub => "publish",
        Role::Sub => "receive",
    };
    let nanos = elapsed.as_nanos();
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { done as f64 / secs } else { 0.0 };
    let per_msg = if done > 0 { nanos as f64 / done as f64 } else { 0.0 };
    println!("{label}: {done} messages in {nanos} ns ({rate:.0} msg/s, {per_msg:.1} ns/msg)");
    Ok(())
}

fn info(config: &ShaleConfig) -> Result<()> {
    let name = &config.topic.name;
    let topic = Topic::attach_any(name).with_context(|| format!("attaching {name}"))?;
    let layout = TopicLayout::new(topic.msg_size(), topic.msg_count())?;
    println!("name:          {}", topic.name());
    println!("msg_size:      {}", topic.msg_size());
    println!("msg_count:     {}", topic.msg_count());
    println!("segment bytes: {}", layout.total_bytes());
    println!("writer cursor: {}", topic.writer_cursor()?);
    Ok(())
}

fn remove(config: &ShaleConfig) -> Result<()> {
    let name = &config.topic.name;
    let existed = Topic::exists(name);
    Topic::remove(name).with_context(|| format!("removing {name}"))?;
    if existed {
        println!("removed {name}");
    } else {
        println!("{name} did not exist; cleaned up any leftover semaphores");
    }
    Ok(())
}

fn pace(interval_ms: u64) {
    if interval_ms > 0 {
        std::thread::sleep(Duration::from_millis(interval_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("shale").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&["publish", "--name", "/ticks", "--msg-size", "8", "--count", "3"]);
        let config = resolve_config(&cli.topic).unwrap();
        assert_eq!(config.topic.name, "/ticks");
        assert_eq!(config.topic.msg_size, 8);
        assert_eq!(config.topic.msg_count, 10);
        assert!(matches!(cli.command, Commands::Publish { count: 3, .. }));
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let cli = parse(&["info", "--msg-count", "0"]);
        assert!(resolve_config(&cli.topic).is_err());
        let cli = parse(&["info", "--name", "ticks"]);
        assert!(resolve_config(&cli.topic).is_err());
    }

    #[test]
    fn measure_requires_a_role() {
        let args = ["shale", "measure", "--count", "5"];
        assert!(Cli::try_parse_from(args).is_err());
        let cli = parse(&["measure", "--role", "sub"]);
        assert!(matches!(
            cli.command,
            Commands::Measure {
                role: Role::Sub,
                count: 100_000,
                create: false
            }
        ));
    }
}
