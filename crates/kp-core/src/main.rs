//! kplot command-line front end.
//!
//! Every command prints one JSON document on stdout (`watch` prints one per
//! line) and exits with a stable [`ExitCode`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use kp_common::{Error, Result, SessionId, SourceId, SCHEMA_VERSION};
use kp_config::{resolve_config, ConfigOverrides, ConfigPaths};
use kp_core::logging::{init_logging, LogConfig, LogFormat};
use kp_core::{CatalogService, ExitCode, OverlayRun};
use kp_telemetry::{QueryRange, DEFAULT_MAX_POINTS};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kplot", version, about = "Browse and query robot telemetry logs")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (default: $XDG_CONFIG_HOME/kplot/config.json if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Telemetry root laid out as <dir>/<source>/<session>/kinfer_log.ndjson
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds since the last write for a session to count as live
    #[arg(long, global = true, value_name = "SECS")]
    recency_window: Option<u64>,

    /// Log level filter (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "warn", env = "KPLOT_LOG")]
    log_level: String,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Also append logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List sources that have at least one session
    Sources,
    /// List the sessions of a source, newest first
    Sessions {
        source: String,
    },
    /// Query one session's records
    Series {
        source: String,
        session: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Query the source's most recent session
    Latest {
        source: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Flatten a session, or several overlaid runs, into named numeric series
    Named {
        #[arg(required_unless_present = "runs", conflicts_with = "runs")]
        source: Option<String>,
        #[arg(required_unless_present = "runs")]
        session: Option<String>,
        /// Added to every step id (aligns runs on one axis)
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i64,
        /// Overlay a run; repeat for each session to align
        #[arg(long = "run", value_name = "SOURCE/SESSION[:OFFSET]", value_parser = parse_run)]
        runs: Vec<OverlayRun>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Find sessions whose "source | session" label contains a string
    Search {
        query: String,
    },
    /// Most recently written session across all sources
    LatestInfo,
    /// Follow the latest session of a source
    Watch {
        source: String,
        /// Milliseconds between printed updates
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Stop after this many updates (default: run until killed)
        #[arg(long)]
        iterations: Option<u64>,
        /// Records per update
        #[arg(long, default_value_t = 10)]
        tail: usize,
    },
}

#[derive(Args, Debug, Clone)]
struct RangeArgs {
    /// First absolute record index (inclusive)
    #[arg(long, requires = "end_index", conflicts_with_all = ["start_time", "end_time"])]
    start_index: Option<u64>,
    /// Last absolute record index (exclusive)
    #[arg(long, requires = "start_index")]
    end_index: Option<u64>,
    /// Earliest timestamp (inclusive)
    #[arg(long, requires = "end_time", allow_negative_numbers = true)]
    start_time: Option<f64>,
    /// Latest timestamp (inclusive)
    #[arg(long, requires = "start_time", allow_negative_numbers = true)]
    end_time: Option<f64>,
    /// Upper bound on returned records
    #[arg(long, default_value_t = DEFAULT_MAX_POINTS)]
    max_points: usize,
}

impl RangeArgs {
    fn range(&self) -> QueryRange {
        match (self.start_index, self.end_index, self.start_time, self.end_time) {
            (Some(start), Some(end), _, _) => QueryRange::index(start, end),
            (_, _, Some(start), Some(end)) => QueryRange::time(start, end),
            _ => QueryRange::All,
        }
    }
}

/// Parse `<source>/<session>[:offset]`.
fn parse_run(spec: &str) -> std::result::Result<OverlayRun, String> {
    let (source, rest) = spec
        .split_once('/')
        .ok_or_else(|| format!("expected <source>/<session>[:offset], got '{}'", spec))?;
    let (session, offset) = match rest.rsplit_once(':') {
        Some((session, offset)) => {
            let offset = offset
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("offset '{}' is not an integer", offset))?;
            (session, offset)
        }
        None => (rest, 0),
    };
    if source.is_empty() || session.is_empty() {
        return Err(format!("empty source or session in '{}'", spec));
    }
    Ok(OverlayRun::new(source, session, offset))
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Sources => "sources",
            Commands::Sessions { .. } => "sessions",
            Commands::Series { .. } => "series",
            Commands::Latest { .. } => "latest",
            Commands::Named { .. } => "named",
            Commands::Search { .. } => "search",
            Commands::LatestInfo => "latest-info",
            Commands::Watch { .. } => "watch",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.global.log_level.clone(),
        format: cli.global.log_format,
        file: cli.global.log_file.clone(),
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("kplot: {}", e);
        std::process::exit(ExitCode::ConfigError.as_i32());
    }

    let command = cli.command.name();
    let code = match run(&cli) {
        Ok(()) => ExitCode::Clean,
        Err(err) => {
            if err.is_not_found() {
                info!(command, error = %err, "nothing to report");
            } else {
                error!(command, error = %err, "command failed");
            }
            print_error(command, &err);
            ExitCode::from(&err)
        }
    };
    std::process::exit(code.as_i32());
}

fn open_catalog(global: &GlobalOpts) -> Result<CatalogService> {
    let overrides = ConfigOverrides {
        data_dir: global.data_dir.clone(),
        recency_window_secs: global.recency_window,
        ..ConfigOverrides::default()
    };
    let paths = ConfigPaths::discover(global.config.clone());
    let config = resolve_config(&overrides, &paths).map_err(|e| Error::Config(e.to_string()))?;
    CatalogService::open(config)
}

fn run(cli: &Cli) -> Result<()> {
    let catalog = open_catalog(&cli.global)?;
    let command = cli.command.name();

    let payload = match &cli.command {
        Commands::Sources => {
            let sources = catalog.list_sources();
            json!({ "count": sources.len(), "sources": sources })
        }
        Commands::Sessions { source } => {
            let sessions = catalog.list_sessions(&SourceId::new(source.as_str()))?;
            json!({ "source": source, "count": sessions.len(), "sessions": sessions })
        }
        Commands::Series {
            source,
            session,
            range,
        } => to_object(&catalog.get_series(
            &SourceId::new(source.as_str()),
            &SessionId::new(session.as_str()),
            range.range(),
            range.max_points,
        )?)?,
        Commands::Latest { source, range } => to_object(&catalog.get_latest(
            &SourceId::new(source.as_str()),
            range.range(),
            range.max_points,
        )?)?,
        Commands::Named { runs, range, .. } if !runs.is_empty() => {
            to_object(&catalog.named_series_multi(runs, range.range(), range.max_points)?)?
        }
        Commands::Named {
            source,
            session,
            offset,
            range,
            ..
        } => {
            let (Some(source), Some(session)) = (source, session) else {
                return Err(Error::Config(
                    "named needs <source> <session> or at least one --run".to_string(),
                ));
            };
            to_object(&catalog.named_series(
                &SourceId::new(source.as_str()),
                &SessionId::new(session.as_str()),
                range.range(),
                range.max_points,
                *offset,
            )?)?
        }
        Commands::Search { query } => {
            let matches = catalog.search(query);
            json!({ "query": query, "count": matches.len(), "matches": matches })
        }
        Commands::LatestInfo => json!({ "latest": catalog.latest_overall() }),
        Commands::Watch {
            source,
            interval_ms,
            iterations,
            tail,
        } => {
            return watch(
                catalog,
                &SourceId::new(source.as_str()),
                Duration::from_millis(*interval_ms),
                *iterations,
                *tail,
            )
        }
    };

    let doc = envelope(command, payload);
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn watch(
    catalog: CatalogService,
    source: &SourceId,
    interval: Duration,
    iterations: Option<u64>,
    tail: usize,
) -> Result<()> {
    let catalog = Arc::new(catalog);
    let worker = catalog.start()?;
    info!(source = %source, interval_ms = interval.as_millis() as u64, "watching latest session");

    let mut printed = 0u64;
    while iterations.map_or(true, |n| printed < n) {
        if printed > 0 {
            thread::sleep(interval);
        }
        let payload = match catalog.tail_latest(source, tail) {
            Ok((key, records)) => json!({
                "source": key.source,
                "session": key.session,
                "label": key.label(),
                "records": records,
            }),
            Err(err) => json!({
                "source": source,
                "error": { "code": err.code(), "message": err.to_string() },
            }),
        };
        println!("{}", serde_json::to_string(&envelope("watch", payload))?);
        printed += 1;
    }

    worker.shutdown()?;
    Ok(())
}

fn to_object<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn envelope(command: &str, payload: Value) -> Value {
    let mut doc = json!({
        "schema_version": SCHEMA_VERSION,
        "generated_at": Utc::now().to_rfc3339(),
        "command": command,
    });
    if let (Some(doc), Value::Object(fields)) = (doc.as_object_mut(), payload) {
        doc.extend(fields);
    }
    doc
}

fn print_error(command: &str, err: &Error) {
    let doc = envelope(
        command,
        json!({
            "error": {
                "code": err.code(),
                "kind": format!("{:?}", ExitCode::from(err)),
                "message": err.to_string(),
            }
        }),
    );
    match serde_json::to_string_pretty(&doc) {
        Ok(text) => println!("{}", text),
        Err(_) => eprintln!("kplot: {}", err),
    }
}
