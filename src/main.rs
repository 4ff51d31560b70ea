use anyhow::Result;
use clap::Parser;
use occucam::{OccucamConfig, PipelineRuntime};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "occucam")]
#[command(about = "Edge camera pipeline that counts occupancy and publishes redacted captures")]
#[command(version)]
#[command(long_about = "Occucam waits for a remote trigger carrying a location id, takes a \
picture with a USB-tethered or network camera, counts persons and empty seats with an external \
detector, reports the counts as device telemetry, and uploads a face-blurred copy of the image \
to object storage.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "occucam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - build components but don't start them
    #[arg(long, help = "Build every component from the configuration, then exit")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily-rotated log files")]
    log_dir: Option<String>,

    /// Run a single cycle for this location and exit
    #[arg(long, value_name = "LOCATION_ID", help = "Run one capture cycle and print its report as JSON")]
    once: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let log_guard = init_logging(&args)?;

    info!("Starting occucam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match OccucamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match config.validate() {
        Ok(()) if args.validate_config => {
            info!("Configuration validation successful");
            println!("✓ Configuration is valid");
            return Ok(());
        }
        Ok(()) => {}
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    }

    let mut runtime = PipelineRuntime::new(config).await.map_err(|e| {
        error!("Failed to build pipeline: {}", e);
        e
    })?;

    runtime.initialize().await.map_err(|e| {
        error!("Failed to initialize pipeline: {}", e);
        e
    })?;

    if args.dry_run {
        info!("Dry run mode - components built but not started");
        println!("✓ Dry run completed successfully - all components built");
        return Ok(());
    }

    if let Some(location_id) = args.once.as_deref() {
        let report = runtime.run_once(location_id).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        let exit_code = if report.is_failed() { 1 } else { 0 };
        drop(log_guard);
        std::process::exit(exit_code);
    }

    runtime.start().await.map_err(|e| {
        error!("Failed to start pipeline: {}", e);
        e
    })?;

    let exit_code = runtime.run().await.map_err(|e| {
        error!("Pipeline error during execution: {}", e);
        e
    })?;

    info!("occucam exited with code: {}", exit_code);
    drop(log_guard);

    // Exit with appropriate code for systemd
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("occucam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    // Files always get JSON lines so they can be shipped as is
    let (file_layer, guard) = match args.log_dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "occucam.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# occucam configuration file");
    println!("# Every option with its default value. Any key can also be set through the");
    println!("# environment, e.g. OCCUCAM_TELEMETRY__DEVICE_KEY.");
    println!();
    println!("{}", toml::to_string_pretty(&OccucamConfig::default())?);
    Ok(())
}
