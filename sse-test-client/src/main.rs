use anyhow::Result;
use clap::Parser;
use colored::*;

mod api_client;
mod cache;
mod output;
mod scenarios;
mod sse_client;

use api_client::{ApiClient, Identity};
use output::print_test_summary;
use sse_client::Connection;

#[derive(Parser)]
#[command(name = "sse-test-client")]
#[command(about = "SSE Integration Testing Tool")]
struct Cli {
    /// Base URL of the backend (e.g., http://localhost:4000)
    #[arg(long)]
    base_url: String,

    /// User 1 identity (format: user_id or user_id:bearer_token)
    #[arg(long, default_value = "test-user-1")]
    user1: String,

    /// User 2 identity (format: user_id or user_id:bearer_token)
    #[arg(long, default_value = "test-user-2")]
    user2: String,

    /// Test scenario to run
    #[arg(long, value_enum)]
    scenario: ScenarioChoice,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone)]
enum ScenarioChoice {
    /// Test that both users receive connected events on stream open
    ConnectionTest,
    /// Test that a targeted event reaches only its addressee
    TargetedDelivery,
    /// Test that a broadcast reaches every live connection
    Broadcast,
    /// Test that events sent to an offline user replay on connect
    OfflineReplay,
    /// Run all tests
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    println!("{}", "=== SETUP PHASE ===".bright_white().bold());

    let user1 = Identity::parse(&cli.user1);
    let user2 = Identity::parse(&cli.user2);
    // A user id no scenario connects beforehand, so the backend sees it as
    // offline. Fresh per run to dodge leftovers in the offline queue.
    let offline_user = Identity {
        user_id: format!("offline-{}", uuid::Uuid::new_v4()),
        token: None,
    };

    let client = reqwest::Client::new();
    let api_client = ApiClient::new(client.clone(), cli.base_url.clone());

    println!("{} Checking backend status...", "→".blue());
    let status = api_client.status(&user1).await?;
    println!(
        "{} Backend ready (delivery backend: {})",
        "✓".green(),
        status["kind"].as_str().unwrap_or("unknown")
    );

    println!("\n{} Establishing SSE connections...", "→".blue());
    let mut sse1 = Connection::establish(
        &cli.base_url,
        &user1,
        format!("User 1 ({})", user1.user_id),
    )
    .await?;
    let mut sse2 = Connection::establish(
        &cli.base_url,
        &user2,
        format!("User 2 ({})", user2.user_id),
    )
    .await?;

    println!("{} User 1 SSE connection established", "✓".green());
    println!("{} User 2 SSE connection established", "✓".green());

    println!("\n{}", "=== TEST PHASE ===".bright_white().bold());

    let mut results = Vec::new();

    match cli.scenario {
        ScenarioChoice::ConnectionTest => {
            results.push(scenarios::test_connection(&user1, &user2, &mut sse1, &mut sse2).await?);
        }
        ScenarioChoice::TargetedDelivery => {
            results.push(
                scenarios::test_targeted_delivery(
                    &user1,
                    &user2,
                    &api_client,
                    &mut sse1,
                    &mut sse2,
                )
                .await?,
            );
        }
        ScenarioChoice::Broadcast => {
            results
                .push(scenarios::test_broadcast(&user1, &api_client, &mut sse1, &mut sse2).await?);
        }
        ScenarioChoice::OfflineReplay => {
            results.push(
                scenarios::test_offline_replay(&cli.base_url, &user1, &offline_user, &api_client)
                    .await?,
            );
        }
        ScenarioChoice::All => {
            results.push(scenarios::test_connection(&user1, &user2, &mut sse1, &mut sse2).await?);
            results.push(
                scenarios::test_targeted_delivery(
                    &user1,
                    &user2,
                    &api_client,
                    &mut sse1,
                    &mut sse2,
                )
                .await?,
            );
            results
                .push(scenarios::test_broadcast(&user1, &api_client, &mut sse1, &mut sse2).await?);
            results.push(
                scenarios::test_offline_replay(&cli.base_url, &user1, &offline_user, &api_client)
                    .await?,
            );
        }
    }

    println!("\n{}", "=== RESULTS ===".bright_white().bold());
    print_test_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);

    if all_passed {
        println!("\n{}", "All tests passed! ✓".bright_green().bold());
    } else {
        println!("\n{}", "Some tests failed! ✗".bright_red().bold());
    }

    std::process::exit(if all_passed { 0 } else { 1 });
}
