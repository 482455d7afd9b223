//! Mergeflow CLI - Command-line client for the Mergeflow daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9627";

#[derive(Parser)]
#[command(name = "mergeflow")]
#[command(about = "Mergeflow filter-and-merge CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "MERGEFLOW_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a filter-and-merge job
    Submit {
        /// Input files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output destination (relative to the daemon's output root)
        #[arg(short, long)]
        dest: String,

        /// Input format (e.g., tsv, csv)
        #[arg(short, long, default_value = "tsv")]
        format: String,

        /// Row filter expression
        #[arg(long)]
        filter: Option<String>,

        /// Caller-chosen job id
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Show a job's current state
    Poll {
        /// Job ID
        job_id: String,
    },

    /// Poll a job until it is DONE or FAILED
    Watch {
        /// Job ID
        job_id: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Show a job's stage timing events
    Timings {
        /// Job ID
        job_id: String,
    },

    /// Show system statistics
    Stats,
}

/// Minimal JSON-RPC 2.0 client over HTTP POST
struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct Reply {
    result: Option<serde_json::Value>,
    error: Option<ReplyError>,
}

#[derive(Deserialize)]
struct ReplyError {
    code: i32,
    message: String,
}

/// job.submit.v1 result (mirrors the daemon's SubmitResponse)
#[derive(Deserialize, Tabled)]
struct Submitted {
    job_id: String,
    status: String,
}

/// job.timings.v1 result (mirrors the daemon's TimingsResponse)
#[derive(Deserialize)]
#[allow(dead_code)]
struct TimingsResult {
    job_id: String,
    timings: Vec<TimingEntry>,
}

#[derive(Deserialize, Tabled)]
struct TimingEntry {
    event: String,
    at: i64,
}

impl RpcClient {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let envelope = Envelope {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let reply: Reply = self
            .http
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.url))?
            .json()
            .await
            .context("Malformed JSON-RPC reply")?;

        if let Some(error) = reply.error {
            anyhow::bail!("{} failed ({}): {}", method, error.code, error.message);
        }
        let result = reply
            .result
            .ok_or_else(|| anyhow::anyhow!("{} returned no result", method))?;
        serde_json::from_value(result).with_context(|| format!("Unexpected {} result", method))
    }
}

/// Resolve each path and attach its size when the file is readable locally
async fn describe_inputs(paths: &[PathBuf]) -> Vec<serde_json::Value> {
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let resolved = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.clone());
        let size = tokio::fs::metadata(&resolved).await.ok().map(|m| m.len());
        inputs.push(json!({
            "path": resolved.to_string_lossy(),
            "size_bytes": size,
        }));
    }
    inputs
}

fn colored_status(status: &str) -> colored::ColoredString {
    match status {
        "DONE" => status.green().bold(),
        "FAILED" => status.red().bold(),
        _ => status.yellow().bold(),
    }
}

fn print_job(job: &serde_json::Value) {
    let status = job["status"].as_str().unwrap_or("UNKNOWN");
    println!("  {} {}", "Job:".bold(), job["job_id"].as_str().unwrap_or("?"));
    println!("  {} {}", "Status:".bold(), colored_status(status));
    println!(
        "  {} {}",
        "Destination:".bold(),
        job["destination"].as_str().unwrap_or("?")
    );
    let expected = job["expected_units"]
        .as_u64()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "  {} {}/{}",
        "Units:".bold(),
        job["completed_units"].as_u64().unwrap_or(0),
        expected
    );
    if let Some(reason) = job["failure_reason"].as_str() {
        println!("  {} {}", "Reason:".bold(), reason.red());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let rpc = RpcClient::new(&cli.rpc_url);

    match cli.command {
        Commands::Submit {
            inputs,
            dest,
            format,
            filter,
            job_id,
        } => {
            let params = json!({
                "job_id": job_id,
                "inputs": describe_inputs(&inputs).await,
                "destination": dest,
                "format": format,
                "filter": filter,
            });

            let submitted: Submitted = rpc.call("job.submit.v1", params).await?;

            println!("{}", "✓ Job submitted".green().bold());
            println!();

            let table = Table::new(vec![submitted]).to_string();
            println!("{}", table);
        }

        Commands::Poll { job_id } => {
            let job: serde_json::Value = rpc.call("job.poll.v1", json!({ "job_id": job_id })).await?;
            print_job(&job);
        }

        Commands::Watch {
            job_id,
            interval_ms,
        } => {
            let mut last_status = String::new();
            loop {
                let job: serde_json::Value =
                    rpc.call("job.poll.v1", json!({ "job_id": job_id })).await?;
                let status = job["status"].as_str().unwrap_or("UNKNOWN").to_string();
                if status != last_status {
                    println!("{} {}", "→".cyan(), colored_status(&status));
                    last_status = status;
                }
                if last_status == "DONE" || last_status == "FAILED" {
                    println!();
                    print_job(&job);
                    if last_status == "FAILED" {
                        std::process::exit(1);
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(interval_ms.max(100))).await;
            }
        }

        Commands::Timings { job_id } => {
            let timings: TimingsResult =
                rpc.call("job.timings.v1", json!({ "job_id": job_id })).await?;

            if timings.timings.is_empty() {
                println!("{}", "No timing events recorded".yellow());
            } else {
                println!("{}", format!("Timings for job {}:", job_id).cyan().bold());
                println!("{}", Table::new(timings.timings));
            }
        }

        Commands::Stats => {
            println!("{}", "System Status".cyan().bold());
            println!();

            match rpc.call::<serde_json::Value>("admin.stats.v1", json!({})).await {
                Ok(stats) => {
                    println!("  {} {}", "RPC URL:".bold(), cli.rpc_url);
                    println!("  {} {}", "Status:".bold(), "ONLINE".green());
                    println!();
                    println!("  {} {}", "Total Jobs:".bold(), stats["total_jobs"]);
                    if let Some(by_status) = stats["jobs_by_status"].as_object() {
                        for (status, count) in by_status {
                            println!("    {} {}", format!("{}:", status).bold(), count);
                        }
                    }
                    println!();
                    println!("  {} {}", "Queued:".bold(), stats["queued_invocations"]);
                    println!("  {} {}", "Running:".bold(), stats["running_invocations"]);
                    println!("  {} {}", "Dead letters:".bold(), stats["dead_letters"]);
                    println!();
                    let db_mb =
                        stats["db_size_bytes"].as_i64().unwrap_or(0) as f64 / (1024.0 * 1024.0);
                    println!("  {} {:.2} MB", "DB Size:".bold(), db_mb);
                    println!("  {} {} seconds", "Uptime:".bold(), stats["uptime_seconds"]);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "ERROR".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }
    }

    Ok(())
}
