//! Basic mining example showing how to use the stream client
//!
//! Connects to a pool, prints the job stream, and answers nothing: a real
//! farm would mine each job and hand solutions back through the handle.

use energi_pool::{ClientEvent, PoolEndpoint, StratumClient, StratumConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("energi_pool=debug")
        .init();

    // Replace with a real pool and account
    let endpoint =
        PoolEndpoint::from_url("stratum+tcp://your_nrg_address.worker1:x@pool.example.com:9999")?;

    let (client, handle, mut events) = StratumClient::new(endpoint, StratumConfig::default());
    tokio::spawn(client.run());
    handle.connect();

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected => info!("Connected to pool"),
            ClientEvent::WorkReceived(job) => {
                info!("New job: {}", job.name);
                info!("  Extranonce: {}", job.extra_nonce);
                info!("  Difficulty: {}", job.difficulty);

                // A real miner would now:
                // 1. Build the block header from the job fields
                // 2. Search the nonce space above job.ex_size_bits
                // 3. Submit solutions via handle.submit_solution(...)
            }
            ClientEvent::SolutionAccepted(_) => info!("Share accepted"),
            ClientEvent::SolutionRejected(_) => info!("Share rejected"),
            ClientEvent::Disconnected => {
                info!("Disconnected from pool");
                break;
            }
        }
    }

    Ok(())
}
