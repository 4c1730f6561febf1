use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "sync-ctl")]
#[command(about = "Operator client for the record-sync worker", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8090")]
    url: String,

    /// Bearer token, if the worker requires one
    #[arg(short, long, env = "RECORD_SYNC_WORKER_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store counts and upstream protection state
    Health,
    /// Show a task and its batches
    Task { task_id: String },
    /// Run one batch now
    Trigger { batch_id: String },
    /// Start an update run on the worker
    StartRun {
        #[arg(long, default_value = "incremental")]
        mode: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    if let Some(token) = &cli.token {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }

    let res = match cli.command {
        Commands::Health => client.get(format!("{base}/health")).headers(headers).send().await?,
        Commands::Task { task_id } => {
            client
                .get(format!("{base}/tasks/{task_id}"))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Trigger { batch_id } => {
            client
                .post(format!("{base}/internal/batches/{batch_id}/run"))
                .headers(headers)
                .send()
                .await?
        }
        Commands::StartRun { mode, dry_run, force } => {
            client
                .post(format!("{base}/runs"))
                .headers(headers)
                .json(&json!({ "mode": mode, "dry_run": dry_run, "force": force }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: worker returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
