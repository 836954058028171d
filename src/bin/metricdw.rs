use clap::{Parser, Subcommand};

use metricdw::{
    ActivityRecord, AggregationTaskEvent, Database, InputPipeline, MetricDW, NewMetric, Period,
    TimeUnit,
};

#[derive(Parser)]
#[command(name = "metricdw", about = "Pipeline metrics warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.metricdw/metricdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run metric aggregation for a pipeline execution event
    Aggregate {
        /// Path to an aggregation task event JSON file
        event: String,
        /// Output the aggregation report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage raw activity records
    Activity {
        #[command(subcommand)]
        action: ActivityAction,
    },
    /// Manage metric definitions
    Metric {
        #[command(subcommand)]
        action: MetricAction,
    },
    /// Query persisted metric rollups
    Query {
        /// Metric name
        name: String,
        /// Group id
        #[arg(long, default_value = "/")]
        group: String,
        /// Period (e.g. 2023, 2023-Q2, 2023-06, 2023-W23, 2023-06-15)
        #[arg(long)]
        period: String,
        /// Time unit to list (defaults to the period's own unit)
        #[arg(long)]
        unit: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum ActivityAction {
    /// Import activity records from a JSON-lines file
    Import {
        /// Path to the JSONL file (one activity record per line)
        file: String,
    },
}

#[derive(Subcommand)]
enum MetricAction {
    /// Define a new metric
    Add {
        /// Metric name
        name: String,
        /// Short description
        #[arg(long)]
        summary: Option<String>,
        /// Pipeline output feeding this metric, as PIPELINE:OUTPUT
        #[arg(long = "input-pipeline", value_name = "PIPELINE:OUTPUT")]
        input_pipelines: Vec<String>,
        /// Existing metric contributing to this metric
        #[arg(long = "input-metric", value_name = "NAME")]
        input_metrics: Vec<String>,
        /// Metric this metric contributes to
        #[arg(long = "output-metric", value_name = "NAME")]
        output_metrics: Vec<String>,
    },
    /// List metric definitions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };
    let dw = MetricDW::new(db);

    match cli.command {
        Commands::Aggregate { event, json } => {
            handle_aggregate(&dw, &event, json).await?;
        }
        Commands::Activity { action } => match action {
            ActivityAction::Import { file } => {
                handle_activity_import(&dw, &file).await?;
            }
        },
        Commands::Metric { action } => {
            handle_metric(&dw, action).await?;
        }
        Commands::Query {
            name,
            group,
            period,
            unit,
            json,
        } => {
            handle_query(&dw, &name, &group, &period, unit.as_deref(), json).await?;
        }
        Commands::Status => {
            handle_status(&dw).await?;
        }
    }

    Ok(())
}

async fn handle_aggregate(dw: &MetricDW, path: &str, json: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let event: AggregationTaskEvent = serde_json::from_str(&raw)?;

    let report = dw.process_aggregation(&event).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &report.time_range {
            Some(range) => println!(
                "Aggregated {} metric(s) over {}..{}: {}",
                report.metrics_processed.len(),
                range.from,
                range.to,
                report.metrics_processed.join(", ")
            ),
            None => println!("No metrics referenced by this execution; nothing to aggregate."),
        }
    }
    Ok(())
}

async fn handle_activity_import(dw: &MetricDW, path: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: ActivityRecord = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("line {}: {e}", line_no + 1))?;
        records.push(record);
    }
    let count = dw.record_activities(records).await?;
    println!("Imported {count} activity record(s)");
    Ok(())
}

async fn handle_metric(dw: &MetricDW, action: MetricAction) -> anyhow::Result<()> {
    match action {
        MetricAction::Add {
            name,
            summary,
            input_pipelines,
            input_metrics,
            output_metrics,
        } => {
            let input_pipelines = input_pipelines
                .iter()
                .map(|spec| parse_input_pipeline(spec))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let metric = dw
                .define_metric(NewMetric {
                    name,
                    summary,
                    input_pipelines,
                    input_metrics,
                    output_metrics,
                })
                .await?;
            println!("Created metric {} ({})", metric.name, metric.id);
        }
        MetricAction::List { json } => {
            let metrics = dw.list_metrics().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else if metrics.is_empty() {
                println!("No metrics defined.");
            } else {
                for metric in &metrics {
                    println!("{} ({})", metric.name, metric.id);
                    if !metric.input_pipelines.is_empty() {
                        let pipelines: Vec<String> = metric
                            .input_pipelines
                            .iter()
                            .map(|p| format!("{}:{}", p.pipeline_id, p.output))
                            .collect();
                        println!("  input pipelines: {}", pipelines.join(", "));
                    }
                    if !metric.input_metrics.is_empty() {
                        println!("  input metrics:   {}", metric.input_metrics.join(", "));
                    }
                    if !metric.output_metrics.is_empty() {
                        println!("  output metrics:  {}", metric.output_metrics.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_input_pipeline(spec: &str) -> anyhow::Result<InputPipeline> {
    match spec.split_once(':') {
        Some((pipeline_id, output)) if !pipeline_id.is_empty() && !output.is_empty() => {
            Ok(InputPipeline {
                pipeline_id: pipeline_id.to_string(),
                output: output.to_string(),
            })
        }
        _ => anyhow::bail!("invalid --input-pipeline '{spec}', expected PIPELINE:OUTPUT"),
    }
}

async fn handle_query(
    dw: &MetricDW,
    name: &str,
    group: &str,
    period: &str,
    unit: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let period = Period::parse(period)?;
    let unit = match unit {
        Some(u) => u.parse::<TimeUnit>()?,
        None => period.time_unit(),
    };
    let range = period.date_range();

    let entries = dw.list_metric_values(name, group, unit, &range).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No {unit} values for '{name}' at {group} in {period}.");
    } else {
        println!("{name} at {group}, {unit} values in {period}:");
        for entry in &entries {
            println!(
                "  {}  group={:>12.3}  subGroups={:>12.3}  total={:>12.3}",
                entry.date,
                entry.group_value,
                entry.sub_groups_value,
                entry.effective_value()
            );
        }
    }
    Ok(())
}

async fn handle_status(dw: &MetricDW) -> anyhow::Result<()> {
    let status = dw.status().await?;
    println!("Warehouse Status");
    println!("  Metric definitions: {}", status.metric_definitions);
    println!("  Activities:         {}", status.activities);
    println!("  Activity values:    {}", status.activity_values);
    println!("  Metric values:      {}", status.metric_values);
    println!(
        "  Last aggregation:   {}",
        status.last_aggregation.as_deref().unwrap_or("never")
    );
    Ok(())
}
