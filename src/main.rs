use replicated_counter::client::{ActiveClient, Client, PassiveClient};
use replicated_counter::config::{ClusterConfig, ReplicationMode};
use replicated_counter::membership::types::NodeId;
use replicated_counter::node::Node;
use replicated_counter::transport::Endpoint;
use replicated_counter::transport::net::NetTransport;
use replicated_counter::transport::protocol::Operation;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --config <path> [--name <node-id>] [--op <Get|Increment|Decrement> --key <key>]", args[0]);
        eprintln!("Example: {} --config cluster.json --name replica-1", args[0]);
        eprintln!("Example: {} --config cluster.json --op Increment --key x", args[0]);

        std::process::exit(1);
    }

    let mut config_path: Option<String> = None;
    let mut name: Option<NodeId> = None;
    let mut operation: Option<Operation> = None;
    let mut key: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--config" => {
                config_path = value;
                i += 2;
            }
            "--name" => {
                name = value.map(NodeId::new);
                i += 2;
            }
            "--op" => {
                operation = value.as_deref().and_then(Operation::parse);
                i += 2;
            }
            "--key" => {
                key = value;
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let config_path = config_path.ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    let config = ClusterConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let peers = config.peer_addresses()?;

    // 1. Client mode: run one operation and print its outcome.
    if let Some(operation) = operation {
        let key = key.ok_or_else(|| anyhow::anyhow!("--key is required with --op"))?;
        let transport = NetTransport::client(name.unwrap_or_else(NodeId::random), peers)?;

        let client: Box<dyn Client> = match config.replication {
            ReplicationMode::Active => Box::new(ActiveClient::new(transport, config.authority.clone())),
            ReplicationMode::Passive => Box::new(PassiveClient::new(transport, config.authority.clone())),
        };

        println!("{}", client.execute(operation, &key).await);
        return Ok(());
    }

    // 2. Server mode:
    let name = name.ok_or_else(|| anyhow::anyhow!("--name is required to run a node"))?;
    tracing::info!("Starting node {} ({:?} replication)", name, config.replication);

    let transport = NetTransport::bind(name, peers).await?;
    let node = Node::from_config(&config, transport.clone());
    node.start();

    tracing::info!("Press Ctrl+C to shutdown");

    let endpoint: Arc<dyn Endpoint> = node;
    transport.serve(endpoint).await?;

    Ok(())
}
