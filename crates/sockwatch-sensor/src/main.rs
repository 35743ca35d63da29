//! sockwatch - kernel TCP and process activity tracer
//!
//! Loads the bpf programs, reads their ring buffer and prints what it sees.

mod demo;
#[cfg(target_os = "linux")]
mod loader;
mod sink;

use clap::{Parser, Subcommand};
use sink::EventSink;
use sockwatch_core::config::{ConfigLoader, OutputFormat, SensorConfig};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sockwatch")]
#[command(version)]
#[command(about = "Trace TCP connects, accepts, closes and process exec/exit", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SOCKWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the kernel probes and print events (requires root)
    Record {
        /// Path to the compiled bpf object
        #[arg(long)]
        ebpf_path: Option<PathBuf>,

        /// Output format (text, json, jsonl)
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Output file for JSONL events
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Kernel function probed for outbound connects
        #[arg(long)]
        connect_symbol: Option<String>,

        /// Disable the exec/exit tracepoints
        #[arg(long)]
        no_process: bool,

        /// Disable the connect/accept/close probes
        #[arg(long)]
        no_network: bool,
    },

    /// Run the userspace tracer on a scripted scenario (no bpf required)
    Demo {
        /// Output format (text, json, jsonl)
        #[arg(short, long)]
        format: Option<OutputFormat>,

        /// Output file for JSONL events
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of times the scenario is replayed
        #[arg(long, default_value = "1")]
        rounds: u32,

        /// Print tracer counters in Prometheus format to stderr
        #[arg(long)]
        metrics: bool,
    },

    /// Show sensor status and capabilities
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let sensor_config = load_config(cli.config.clone());

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match sensor_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Record {
            ebpf_path,
            format,
            output,
            connect_symbol,
            no_process,
            no_network,
        } => {
            let mut config = sensor_config;
            if let Some(path) = ebpf_path {
                config.capture.ebpf_path = Some(path.to_string_lossy().to_string());
            }
            if let Some(symbol) = connect_symbol {
                config.capture.connect_symbol = symbol;
            }
            config.capture.process &= !no_process;
            config.capture.network &= !no_network;
            apply_output_args(&mut config, format, output);
            record_command(config).await
        }
        Commands::Demo {
            format,
            output,
            rounds,
            metrics,
        } => {
            let mut config = sensor_config;
            apply_output_args(&mut config, format, output);
            let mut sink = open_sink(&config)?;
            demo::demo_command(
                demo::DemoConfig {
                    rounds,
                    correlation_capacity: config.capture.correlation_capacity,
                    metrics,
                },
                &mut sink,
            )
        }
        Commands::Status => status_command(&sensor_config),
    }
}

fn load_config(cli_path: Option<PathBuf>) -> SensorConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // logging is not up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

/// CLI arguments take precedence over the config file
fn apply_output_args(config: &mut SensorConfig, format: Option<OutputFormat>, output: Option<PathBuf>) {
    if let Some(path) = output {
        config.output.path = Some(path.to_string_lossy().to_string());
        // a file was asked for, so write a file unless a format says otherwise
        if format.is_none() {
            config.output.format = OutputFormat::Jsonl;
        }
    }
    if let Some(format) = format {
        config.output.format = format;
    }
}

fn open_sink(config: &SensorConfig) -> anyhow::Result<EventSink> {
    let path = config.output.path.as_ref().map(PathBuf::from);
    EventSink::open(config.output.format, path.as_deref())
}

#[cfg(target_os = "linux")]
async fn record_command(config: SensorConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use sockwatch_core::TracerStats;

    ConfigLoader::new().validate(&config)?;

    let ebpf_path = config
        .capture
        .ebpf_path
        .as_ref()
        .map(PathBuf::from)
        .context("bpf object path not configured. Pass --ebpf-path or set capture.ebpf_path")?;

    if !loader::check_ebpf_available() {
        warn!("eBPF support looks incomplete, trying anyway");
    }

    let mut capture = loader::Capture::load(&ebpf_path, &config.capture)?;
    let mut sink = open_sink(&config)?;
    let stats = TracerStats::new();

    info!("Tracing started (output: {}), press Ctrl+C to stop", sink.format());
    capture.run(&mut sink, &stats).await?;

    info!("{}", loader::summary(&stats));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn record_command(_config: SensorConfig) -> anyhow::Result<()> {
    anyhow::bail!("record is only supported on Linux")
}

fn status_command(config: &SensorConfig) -> anyhow::Result<()> {
    println!();
    println!("sockwatch v{}", sockwatch_core::SENSOR_VERSION);
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(target_os = "linux")]
    {
        println!();
        println!("Linux Capabilities:");
        println!("  Running as root: {}", loader::is_root());
        println!(
            "  eBPF supported: {}",
            std::path::Path::new("/sys/fs/bpf").exists()
        );
        println!(
            "  BTF available: {}",
            std::path::Path::new("/sys/kernel/btf/vmlinux").exists()
        );
        match loader::get_kernel_version() {
            Some((major, minor, patch)) => println!("  Kernel: {}.{}.{}", major, minor, patch),
            None => println!("  Kernel: unknown"),
        }
    }

    println!();
    println!("Configuration:");
    println!(
        "  bpf object: {}",
        config.capture.ebpf_path.as_deref().unwrap_or("(not set)")
    );
    println!("  connect symbol: {}", config.capture.connect_symbol);
    println!("  process events: {}", config.capture.process);
    println!("  network events: {}", config.capture.network);
    println!("  output: {}", config.output.format);
    if let Some(path) = ConfigLoader::default_config_path() {
        println!("  user config: {}", path.display());
    }
    println!();

    Ok(())
}
