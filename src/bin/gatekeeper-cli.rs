use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gatekeeper-cli")]
#[command(about = "Management CLI for the gatekeeper gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// List circuit breaker state per key
    Circuits,
    /// Force a circuit back to Closed
    Reset {
        /// Circuit breaker policy name
        policy: String,
        /// Key within the policy (e.g. the upstream authority)
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    match cli.command {
        Commands::Status => {
            let res = client
                .get(format!("{}/admin/status", cli.url))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Circuits => {
            let res = client
                .get(format!("{}/admin/circuits", cli.url))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Reset { policy, key } => {
            let res = client
                .post(format!("{}/admin/circuits/{}/{}/reset", cli.url, policy, key))
                .headers(headers)
                .send()
                .await?;
            if res.status().is_success() {
                println!("Circuit {policy}/{key} reset");
            } else {
                eprintln!("Error: Admin API returned status {}", res.status());
            }
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
