use clap::{Parser, Subcommand};
use dynfilter_common::{Config, FilterEncoding, FilterScope};
use dynfilter_core::{
    read_global_filter, read_lane_batches, wait_for_completion, Channel, CollectorLimits,
    CompletionStatus, DynamicFilterSourceOperatorFactory, FilterKind, GlobalFilter,
    InMemoryStateStore, StateStore, TupleDomain,
};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

fn parse_scope(s: &str) -> Result<FilterScope, String> {
    match s.to_ascii_lowercase().as_str() {
        "local" => Ok(FilterScope::Local),
        "global" => Ok(FilterScope::Global),
        _ => Err(format!("scope must be 'local' or 'global', got {s}")),
    }
}

fn parse_encoding(s: &str) -> Result<FilterEncoding, String> {
    match s.to_ascii_lowercase().as_str() {
        "bloom" => Ok(FilterEncoding::Bloom),
        "hashset" | "set" => Ok(FilterEncoding::Hashset),
        _ => Err(format!("encoding must be 'bloom' or 'hashset', got {s}")),
    }
}

#[derive(Parser)]
#[command(name = "dynfilter", version, about = "Build-side dynamic filter simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect dynamic filters from a parquet build side across parallel lanes
    Simulate {
        path: String,
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        #[arg(long, default_value_t = 4)]
        lanes: usize,
        #[arg(long, value_parser = parse_scope)]
        scope: Option<FilterScope>,
        #[arg(long, value_parser = parse_encoding)]
        encoding: Option<FilterEncoding>,
        #[arg(long, default_value = "query_0")]
        query_id: String,
        #[arg(long, default_value = "local-node")]
        node_id: String,
        #[arg(long, default_value_t = 8192)]
        batch_size: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        #[arg(long)]
        init: bool,
    },
}

struct SimulateArgs {
    path: String,
    columns: Option<Vec<String>>,
    lanes: usize,
    kind: FilterKind,
    query_id: String,
    node_id: String,
    batch_size: usize,
    json: bool,
}

#[derive(Debug, Serialize)]
struct LaneReport {
    lane: usize,
    lane_id: u64,
    pages: usize,
    rows: usize,
    overflowed: bool,
}

#[derive(Debug, Serialize)]
struct GlobalReport {
    filter_id: String,
    status: Option<CompletionStatus>,
    encoding: &'static str,
    // distinct values for hashset filters, partial count for bloom filters
    size: usize,
    values: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    query_id: String,
    scope: FilterScope,
    encoding: FilterEncoding,
    lanes: Vec<LaneReport>,
    local_predicates: Vec<TupleDomain>,
    global: Vec<GlobalReport>,
}

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();
    init_logging(&config.logging.level);
    match cli.command {
        Commands::Simulate {
            path,
            columns,
            lanes,
            scope,
            encoding,
            query_id,
            node_id,
            batch_size,
            json,
        } => {
            let kind = FilterKind::new(
                scope.unwrap_or(config.filtering.scope),
                encoding.unwrap_or(config.filtering.data_structure),
            );
            let args = SimulateArgs {
                path,
                columns,
                lanes,
                kind,
                query_id,
                node_id,
                batch_size,
                json,
            };
            run_simulate(args, &config)?
        }
        Commands::Config { init } => run_config(init, &config)?,
    }
    Ok(())
}

fn run_config(init: bool, config: &Config) -> anyhow::Result<()> {
    if init {
        config.save()?;
        println!("wrote {}", Config::config_path().display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn run_simulate(args: SimulateArgs, config: &Config) -> anyhow::Result<()> {
    let build = read_lane_batches(
        Path::new(&args.path),
        args.columns.as_deref(),
        args.lanes,
        args.batch_size,
    )?;
    if build.schema.fields().is_empty() {
        anyhow::bail!("no build-side columns selected: {}", args.path);
    }
    let channels: Vec<Channel> = build
        .schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            Channel::new(
                format!("df_{}", f.name()),
                f.data_type().clone(),
                i,
                args.query_id.clone(),
            )
        })
        .collect();

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let delivered: Arc<Mutex<Vec<TupleDomain>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let mut factory = DynamicFilterSourceOperatorFactory::new(
        channels.clone(),
        Arc::new(move |p: TupleDomain| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(p);
        }),
        CollectorLimits::from(&config.filtering),
        args.kind,
        args.node_id.clone(),
        args.query_id.clone(),
        Some(Arc::clone(&store)),
    )?;

    let lanes = build
        .lanes
        .into_par_iter()
        .enumerate()
        .map(|(lane, pages)| run_lane(&factory, lane, pages))
        .collect::<anyhow::Result<Vec<LaneReport>>>()?;
    factory.no_more_operators()?;

    let timeout = Duration::from_millis(config.filtering.completion_timeout_ms);
    let mut global = Vec::with_capacity(channels.len());
    for ch in &channels {
        let status = wait_for_completion(
            store.as_ref(),
            &ch.filter_id,
            &ch.query_id,
            timeout,
            Duration::from_millis(10),
        )?;
        let filter = read_global_filter(store.as_ref(), &ch.filter_id, &ch.query_id)?;
        let (encoding, size, values) = match filter {
            GlobalFilter::All => ("all", 0, None),
            GlobalFilter::Values(v) => ("hashset", v.len(), Some(v.into_iter().collect())),
            GlobalFilter::Bloom(f) => ("bloom", f.len(), None),
        };
        global.push(GlobalReport {
            filter_id: ch.filter_id.clone(),
            status,
            encoding,
            size,
            values,
        });
    }

    let local_predicates = std::mem::take(&mut *delivered.lock().unwrap_or_else(|e| e.into_inner()));
    let report = SimulationReport {
        query_id: args.query_id,
        scope: args.kind.scope,
        encoding: args.kind.encoding,
        lanes,
        local_predicates,
        global,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn run_lane(
    factory: &DynamicFilterSourceOperatorFactory,
    lane: usize,
    pages: Vec<arrow::record_batch::RecordBatch>,
) -> anyhow::Result<LaneReport> {
    let span = info_span!("lane", lane);
    let mut op = factory.create_operator(span)?;
    let mut rows = 0;
    let page_count = pages.len();
    for page in pages {
        rows += page.num_rows();
        op.add_input(page)?;
        op.get_output(); // pass-through, nothing downstream here
    }
    op.finish();
    Ok(LaneReport {
        lane,
        lane_id: op.lane_id(),
        pages: page_count,
        rows,
        overflowed: op.is_overflowed(),
    })
}

fn print_report(report: &SimulationReport) {
    println!("{:<24} {}", "query_id:", report.query_id);
    println!("{:<24} {:?}", "scope:", report.scope);
    println!("{:<24} {:?}", "encoding:", report.encoding);
    for lane in &report.lanes {
        println!(
            "lane {:<3} id={:<4} pages={:<5} rows={:<8} overflowed={}",
            lane.lane, lane.lane_id, lane.pages, lane.rows, lane.overflowed
        );
    }
    let all = report.local_predicates.iter().filter(|p| p.is_all()).count();
    println!(
        "{:<24} {} delivered, {} accept-all",
        "local predicates:",
        report.local_predicates.len(),
        all
    );
    for g in &report.global {
        let status = g
            .status
            .as_ref()
            .map(|s| format!("{}/{} lanes finished", s.finished, s.registered))
            .unwrap_or_else(|| "timed out".into());
        println!("global {:<17} {} ({status})", g.filter_id, g.encoding);
        if let Some(values) = &g.values {
            let preview: Vec<&str> = values.iter().take(10).map(|s| s.as_str()).collect();
            println!("  {} values: {}", g.size, preview.join(", "));
        } else if g.encoding == "bloom" {
            println!("  {} bloom partials", g.size);
        }
    }
}
