use facet::Facet;
use figue as args;
use std::sync::Arc;
use threadwatch::{Dispatcher, ObserverConfig, ReportFormat, SinkSpec};
use tracing::info;

mod demo;

type AnyResult<T> = Result<T, String>;

const DEFAULT_DEMO_WORKERS: u32 = 4;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// JSON probe configuration; the built-in thread-creation preset when absent.
    #[facet(args::named, default)]
    config: Option<String>,
    /// Overrides the configured sink (stdout, stderr, tracing, ring:<n>, file:<path>).
    #[facet(args::named, default)]
    sink: Option<String>,
    /// Overrides the configured report format (text, json).
    #[facet(args::named, default)]
    format: Option<String>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    /// Print the configured probes and exit.
    Probes,
    /// Grow a small worker pool through the observed thread factory.
    Demo {
        #[facet(args::named, default)]
        workers: Option<u32>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    match cli.command {
        CommandKind::Probes => {
            print_probes(&config)?;
            Ok(())
        }
        CommandKind::Demo { workers } => {
            let dispatcher = Arc::new(config.build_dispatcher().map_err(|e| e.to_string())?);
            threadwatch::install(dispatcher.clone()).map_err(|e| e.to_string())?;
            demo::run(&dispatcher, workers.unwrap_or(DEFAULT_DEMO_WORKERS))?;
            report_stats(&dispatcher);
            Ok(())
        }
    }
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("threadwatch")
                .description("Report which code paths create threads")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn load_config(cli: &Cli) -> AnyResult<ObserverConfig> {
    let mut config = match &cli.config {
        Some(path) => ObserverConfig::load(path).map_err(|e| e.to_string())?,
        None => ObserverConfig::preset(),
    };
    if let Some(sink) = &cli.sink {
        sink.parse::<SinkSpec>().map_err(|e| e.to_string())?;
        config.sink = Some(sink.clone());
    }
    if let Some(format) = &cli.format {
        format.parse::<ReportFormat>()?;
        config.format = Some(format.clone());
    }
    Ok(config)
}

fn print_probes(config: &ObserverConfig) -> AnyResult<()> {
    let descriptors = config.descriptors().map_err(|e| e.to_string())?;
    let id_width = descriptors
        .iter()
        .map(|d| d.id.as_str().len())
        .max()
        .unwrap_or(0)
        .max("ID".len());
    println!("{:<id_width$}  {:<8}  {:<9}  TRIGGER", "ID", "STATE", "DEPTH");
    for descriptor in descriptors {
        println!(
            "{:<id_width$}  {:<8}  {:<9}  {}",
            descriptor.id.as_str(),
            if descriptor.enabled { "enabled" } else { "disabled" },
            descriptor.max_stack_depth.to_string(),
            descriptor.trigger_location
        );
    }
    Ok(())
}

fn report_stats(dispatcher: &Dispatcher) {
    let stats = dispatcher.stats();
    info!(
        fired = stats.fired,
        reported = stats.reported,
        dropped = stats.dropped,
        "demo finished"
    );
}
