use std::time::Instant;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "async-cli")]
#[command(about = "Client for the deferred-http async resources", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fire concurrent long-running POSTs and report the elapsed time
    Post {
        #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
        ids: Vec<String>,
    },
    /// Call the resource whose operation outlives its deadline
    Timeout,
    /// Show coordinator status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Post { ids } => {
            let start = Instant::now();
            let requests = ids.iter().map(|id| {
                client
                    .post(format!("{}/async", cli.url))
                    .body(id.clone())
                    .send()
            });
            for (id, result) in ids.iter().zip(join_all(requests).await) {
                let res = result?;
                let status = res.status();
                println!("{id}: {status} {}", res.text().await?);
            }
            println!("elapsed: {} ms", start.elapsed().as_millis());
        }
        Commands::Timeout => {
            let start = Instant::now();
            let res = client.get(format!("{}/async/timeout", cli.url)).send().await?;
            let status = res.status();
            println!("{status} {}", res.text().await?);
            println!("elapsed: {} ms", start.elapsed().as_millis());
        }
        Commands::Status => {
            let res = client.get(format!("{}/status", cli.url)).send().await?;
            if !res.status().is_success() {
                eprintln!("Error: status endpoint returned {}", res.status());
                return Ok(());
            }
            let json: Value = res.json().await?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }

    Ok(())
}
