use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mss::monitor::install_signal_handlers;
use mss::{
    ChannelConfig, Error, Monitor, MonitorConfig, Mss, MssConfig, Region, RoutingMode,
};

#[derive(Parser)]
#[command(name = "mss", version, about = "Monitor subsystem tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or replace) the shared region.
    Init { region: PathBuf },
    /// Run the monitor in the foreground until SIGINT or SIGTERM.
    Monitor {
        region: PathBuf,
        #[arg(long = "config")]
        config: Option<PathBuf>,
        /// Create the region first if it does not exist.
        #[arg(long = "create")]
        create: bool,
    },
    /// Print tables, topics and channel counters as JSON.
    Inspect { region: PathBuf },
    /// Publish one event.
    Publish {
        region: PathBuf,
        topic: String,
        payload: String,
        #[arg(long = "reliable")]
        reliable: bool,
        #[arg(long = "timeout-ms", default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Subscribe and print events as they arrive.
    Tail {
        region: PathBuf,
        topic: String,
        #[arg(long = "anycast")]
        anycast: bool,
        #[arg(long = "limit")]
        limit: Option<usize>,
        /// Give up after this long without an event.
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Init { region } => cmd_init(&region, &mut out)?,
        Commands::Monitor {
            region,
            config,
            create,
        } => cmd_monitor(&region, config, create)?,
        Commands::Inspect { region } => cmd_inspect(&region, &mut out)?,
        Commands::Publish {
            region,
            topic,
            payload,
            reliable,
            timeout_ms,
        } => cmd_publish(&region, &topic, &payload, reliable, timeout_ms, &mut out)?,
        Commands::Tail {
            region,
            topic,
            anycast,
            limit,
            timeout_ms,
        } => cmd_tail(&region, &topic, anycast, limit, timeout_ms, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_init(path: &Path, out: &mut dyn Write) -> Result<()> {
    Region::create(path).with_context(|| format!("create region {}", path.display()))?;
    writeln!(out, "initialised {} ({} bytes)", path.display(), mss::shmem::shmem_size())?;
    Ok(())
}

fn cmd_monitor(path: &Path, config_path: Option<PathBuf>, create: bool) -> Result<()> {
    let region = if create && !path.exists() {
        Region::create(path)?
    } else {
        Region::open(path).with_context(|| format!("open region {}", path.display()))?
    };
    let config = match &config_path {
        Some(p) => MonitorConfig::load(p).with_context(|| format!("load {}", p.display()))?,
        None => MonitorConfig::default(),
    };
    install_signal_handlers()?;
    let mut monitor = Monitor::new(Arc::new(region), config).with_signals();
    if let Some(p) = config_path {
        monitor = monitor.with_config_path(p);
    }
    let report = monitor.run()?;
    log::info!(
        "monitor exited: {} gc passes, {} subscribers and {} publishers reclaimed",
        report.gc_passes,
        report.reclaimed_subs,
        report.reclaimed_pubs
    );
    if !report.drained_cleanly {
        bail!("shutdown drain timed out");
    }
    Ok(())
}

fn cmd_inspect(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mss = Mss::open(path).with_context(|| format!("open region {}", path.display()))?;
    let snapshot = mss.snapshot();
    serde_json::to_writer_pretty(&mut *out, &snapshot)?;
    writeln!(out)?;
    Ok(())
}

fn cmd_publish(
    path: &Path,
    topic: &str,
    payload: &str,
    reliable: bool,
    timeout_ms: u64,
    out: &mut dyn Write,
) -> Result<()> {
    let config = MssConfig {
        reliable_timeout: Duration::from_millis(timeout_ms),
        ..MssConfig::default()
    };
    let mss = Mss::open_with_config(path, config)?;
    let mut publisher = mss.pub_connect(ChannelConfig::default())?;
    let delivery = if reliable {
        publisher.publish_reliable(topic, payload.as_bytes())
    } else {
        publisher.publish_fast(topic, payload.as_bytes())
    };
    match delivery {
        Ok(d) => writeln!(
            out,
            "{topic}: delivered={} dropped={} peers_gone={}",
            d.delivered, d.dropped, d.peers_gone
        )?,
        Err(err) => bail!("publish to {topic} failed: {} ({err})", err.code().as_str()),
    }
    publisher.disconnect()?;
    Ok(())
}

fn cmd_tail(
    path: &Path,
    topic: &str,
    anycast: bool,
    limit: Option<usize>,
    timeout_ms: Option<u64>,
    out: &mut dyn Write,
) -> Result<()> {
    let mss = Mss::open(path)?;
    let mode = if anycast {
        RoutingMode::Anycast
    } else {
        RoutingMode::Multicast
    };
    let mut sub = mss.sub_connect(ChannelConfig::default())?;
    sub.subscribe(topic, mode)?;
    let timeout = timeout_ms.map(Duration::from_millis);
    let mut seen = 0usize;
    while limit.map_or(true, |l| seen < l) {
        let event = match sub.receive(timeout) {
            Ok(event) => event,
            // Without --timeout-ms, tail keeps waiting past each capped wait.
            Err(Error::Timeout) if timeout.is_none() => continue,
            Err(Error::Timeout) | Err(Error::Shutdown) => break,
            Err(err) => return Err(err.into()),
        };
        let name = mss
            .topic_name(event.topic_key)
            .unwrap_or_else(|| format!("#{}", event.topic_key));
        writeln!(
            out,
            "{} {name} {}",
            event.timestamp_us,
            String::from_utf8_lossy(event.payload())
        )?;
        out.flush()?;
        seen += 1;
    }
    sub.disconnect()?;
    Ok(())
}
