use anyhow::Result;
use clap::{Parser, Subcommand};
use logwarden::config::AppConfig;
use logwarden::record::{LogFilter, LogLevel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "logwarden",
    about = "Unsupervised anomaly detection for data-pipeline logs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scoring engine)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Retrain the anomaly model from the latest stored logs
    Train,

    /// Score the latest stored logs and print the anomalies
    Detect {
        /// Only logs from this pipeline
        #[arg(long)]
        pipeline: Option<String>,

        /// Only logs at this level
        #[arg(long)]
        level: Option<String>,

        /// Number of recent logs to score
        #[arg(long, default_value = "100")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the most recent stored logs
    Logs {
        #[arg(long)]
        pipeline: Option<String>,

        #[arg(long)]
        level: Option<String>,

        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Insert the sample pipeline logs into the store
    Seed,

    /// Ask the pipeline assistant a question, or start an interactive session
    Chat {
        /// Question text; omit to read questions from stdin
        message: Option<String>,
    },
}

fn filter(pipeline: Option<String>, level: Option<String>) -> LogFilter {
    LogFilter {
        pipeline,
        level: level.as_deref().map(LogLevel::parse),
    }
}

fn init_tracing(config: &AppConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Logwarden daemon");
            logwarden::serve(config).await?;
        }
        Commands::Train => {
            let state = logwarden::build_state(&config)?;
            let summary = state.engine.train(None).await?;
            println!(
                "Model v{} trained on {} records in {} ms (threshold {:.4})",
                summary.version, summary.sample_size, summary.duration_ms, summary.threshold
            );
        }
        Commands::Detect {
            pipeline,
            level,
            limit,
            json,
        } => {
            let state = logwarden::build_state(&config)?;
            let records = state.source.fetch(limit, &filter(pipeline, level)).await?;
            let report = state.engine.detect(Some(records)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nLogwarden Anomaly Report ({:?})", report.status);
                println!(
                    "Scored {} logs, {} anomalous",
                    report.total(),
                    report.anomaly_count()
                );
                println!("{:<8} | {:<10} | {:<12} | Message", "Score", "Level", "Pipeline");
                println!("{:-<8}-|-{:-<10}-|-{:-<12}-|-{:-<40}", "", "", "", "");
                for v in report.anomalies() {
                    println!(
                        "{:<8.4} | {:<10} | {:<12} | {}",
                        v.score,
                        v.record.level,
                        v.record.pipeline.as_deref().unwrap_or("-"),
                        v.record.message
                    );
                }
                println!();
            }
        }
        Commands::Logs {
            pipeline,
            level,
            limit,
        } => {
            let state = logwarden::build_state(&config)?;
            let records = state.source.fetch(limit, &filter(pipeline, level)).await?;
            if records.is_empty() {
                println!("No logs found.");
            }
            for r in records {
                let ts = r.timestamp.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
                println!(
                    "{} [{}] {}: {}",
                    ts,
                    r.level,
                    r.pipeline.as_deref().unwrap_or("-"),
                    r.message
                );
            }
        }
        Commands::Seed => {
            let store = logwarden::storage::SqliteLogStore::open(&config.storage.db_path)?;
            let n = store.insert_sample_logs()?;
            println!("Inserted {} sample logs.", n);
        }
        Commands::Chat { message } => {
            let state = logwarden::build_state(&config)?;
            match message {
                Some(message) => {
                    let reply = state.assistant.cached_completion(&message).await;
                    println!("{}", reply.text);
                }
                None => {
                    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                    logwarden::assistant::chat_session(&state.assistant, stdin, tokio::io::stdout()).await?;
                }
            }
        }
    }

    Ok(())
}
