//! End-to-end scenarios over the in-process network.
//!
//! Every node runs its real failure detector, so membership is formed by
//! heartbeats. Scenarios that are not about detection use a long heartbeat
//! interval: the first heartbeat is sent at start, and no one is declared
//! dead while the test runs.

use async_trait::async_trait;
use replicated_counter::client::{ActiveClient, Client, PassiveClient};
use replicated_counter::config::{ClusterConfig, ReplicationMode, TreeLinks};
use replicated_counter::membership::authority::MembershipAuthority;
use replicated_counter::membership::detector::{FailureDetector, LivenessSink};
use replicated_counter::membership::types::{LivenessEvent, NodeId};
use replicated_counter::node::{Node, Role};
use replicated_counter::replication::ReplicationStrategy;
use replicated_counter::replication::passive::PassiveReplica;
use replicated_counter::storage::memory::KeyValueStore;
use replicated_counter::transport::memory::MemoryNetwork;
use replicated_counter::transport::protocol::{ABORTED, ACK, ClientOp, Operation, Request};
use replicated_counter::transport::Transport;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const AUTHORITY: &str = "authority";
const SLOW_HEARTBEAT_MS: i64 = 10_000;
const POLL: Duration = Duration::from_millis(10);
const POLL_ATTEMPTS: usize = 300;

fn ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|name| NodeId::new(*name)).collect()
}

fn cluster_config(
    mode: ReplicationMode,
    replicas: &[&str],
    heartbeat_interval_ms: i64,
    checkpoint_interval_ms: i64,
) -> ClusterConfig {
    let mut tree = HashMap::new();
    tree.insert(
        NodeId::new(AUTHORITY),
        TreeLinks {
            parents: vec![],
            children: ids(replicas),
        },
    );
    for replica in replicas {
        tree.insert(
            NodeId::new(*replica),
            TreeLinks {
                parents: ids(&[AUTHORITY]),
                children: vec![],
            },
        );
    }

    ClusterConfig {
        peers: HashMap::new(),
        tree,
        authority: NodeId::new(AUTHORITY),
        replicas: ids(replicas),
        replication: mode,
        initial_data: BTreeMap::from([("x".to_string(), 0)]),
        heartbeat_interval_ms,
        heartbeat_tolerance: 3,
        checkpoint_interval_ms,
        log_level: "info".to_string(),
    }
}

struct Cluster {
    network: Arc<MemoryNetwork>,
    config: ClusterConfig,
    authority: Arc<MembershipAuthority>,
}

impl Cluster {
    fn new(config: ClusterConfig) -> Self {
        let network = MemoryNetwork::new();
        let node = Node::from_config(&config, network.transport(AUTHORITY));
        network.register(node.id.clone(), node.clone());
        node.start();

        let authority = match node.role() {
            Role::Authority(authority) => authority.clone(),
            _ => panic!("{} should be the authority", AUTHORITY),
        };

        Self {
            network,
            config,
            authority,
        }
    }

    fn start(&self, node: Arc<Node>) {
        self.network.register(node.id.clone(), node.clone());
        node.start();
    }

    /// Starts a configured replica and waits until it is a member.
    async fn join(&self, name: &str) -> Arc<dyn ReplicationStrategy> {
        let node = Node::from_config(&self.config, self.network.transport(name));
        let replica = match node.role() {
            Role::Replica(replica) => replica.clone(),
            _ => panic!("{} should be a replica", name),
        };
        self.start(node);

        wait_until(|| self.authority.members().contains(&NodeId::new(name))).await;
        wait_for_view(replica.as_ref(), &self.authority.members()).await;
        replica
    }

    /// Starts a passive replica keeping its concrete type.
    async fn join_passive(&self, name: &str) -> Arc<PassiveReplica> {
        let transport = self.network.transport(name);
        let replica = PassiveReplica::new(
            transport.clone(),
            KeyValueStore::from_entries(self.config.initial_data.clone()),
            self.config.checkpoint_interval_ms,
        );
        let links = self.config.links(&NodeId::new(name));
        let detector = FailureDetector::new(
            transport,
            links.parents,
            links.children,
            self.config.heartbeat_interval_ms,
            self.config.heartbeat_tolerance,
            None,
        );
        self.start(Node::new(NodeId::new(name), detector, Role::Replica(replica.clone())));

        wait_until(|| self.authority.members().contains(&NodeId::new(name))).await;
        wait_for_view(replica.as_ref(), &self.authority.members()).await;
        replica
    }

    fn active_client(&self, name: &str) -> ActiveClient {
        ActiveClient::new(self.network.transport(name), NodeId::new(AUTHORITY))
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..POLL_ATTEMPTS {
        if condition() {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("Condition not reached in time");
}

async fn wait_for_view(replica: &dyn ReplicationStrategy, expected: &[NodeId]) {
    for _ in 0..POLL_ATTEMPTS {
        if replica.core().membership().await == expected {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("{} never installed {:?}", replica.core().id, expected);
}

fn value_of(replica: &dyn ReplicationStrategy, key: &str) -> Option<i64> {
    replica.core().snapshot().get(key)
}

// ============================================================
// ACTIVE REPLICATION
// ============================================================

#[tokio::test]
async fn test_unanimous_commit_reaches_every_replica() {
    let cluster = Cluster::new(cluster_config(
        ReplicationMode::Active,
        &["a", "b", "c"],
        SLOW_HEARTBEAT_MS,
        10_000,
    ));
    let a = cluster.join("a").await;
    let b = cluster.join("b").await;
    let c = cluster.join("c").await;
    assert_eq!(cluster.authority.members(), ids(&["a", "b", "c"]));
    assert!(a.core().is_primary());

    let client = cluster.active_client("client");
    assert_eq!(client.increment("x").await, "1");
    assert_eq!(client.increment("x").await, "2");
    assert_eq!(client.get("x").await, "2");
    assert_eq!(client.decrement("missing").await, "No such key.");

    for replica in [&a, &b, &c] {
        assert_eq!(value_of(replica.as_ref(), "x"), Some(2));
        assert_eq!(value_of(replica.as_ref(), "missing"), None);
    }
}

#[tokio::test]
async fn test_unreachable_member_aborts_without_state_change() {
    let cluster = Cluster::new(cluster_config(
        ReplicationMode::Active,
        &["a", "b", "c"],
        SLOW_HEARTBEAT_MS,
        10_000,
    ));
    let a = cluster.join("a").await;
    let _b = cluster.join("b").await;
    let c = cluster.join("c").await;

    cluster.network.crash(&NodeId::new("b"));

    let client = cluster.active_client("client").with_max_attempts(1);
    assert_eq!(client.increment("x").await, ABORTED);

    assert_eq!(value_of(a.as_ref(), "x"), Some(0));
    assert_eq!(value_of(c.as_ref(), "x"), Some(0));
}

#[tokio::test]
async fn test_joining_replica_catches_up() {
    let cluster = Cluster::new(cluster_config(
        ReplicationMode::Active,
        &["a", "b", "d"],
        SLOW_HEARTBEAT_MS,
        10_000,
    ));
    let a = cluster.join("a").await;
    let b = cluster.join("b").await;

    let client = cluster.active_client("client");
    assert_eq!(client.increment("x").await, "1");
    assert_eq!(client.increment("x").await, "2");

    let d = cluster.join("d").await;
    assert_eq!(value_of(d.as_ref(), "x"), Some(2));

    // The joiner now votes and executes like everyone else.
    assert_eq!(client.increment("x").await, "3");
    for replica in [&a, &b, &d] {
        assert_eq!(value_of(replica.as_ref(), "x"), Some(3));
    }
}

#[tokio::test]
async fn test_next_member_takes_over_after_primary_crash() {
    let cluster = Cluster::new(cluster_config(ReplicationMode::Active, &["a", "b", "c"], 20, 10_000));
    let _a = cluster.join("a").await;
    let b = cluster.join("b").await;
    let c = cluster.join("c").await;

    let client = cluster.active_client("client");
    assert_eq!(client.increment("x").await, "1");

    cluster.network.crash(&NodeId::new("a"));
    wait_until(|| cluster.authority.members() == ids(&["b", "c"])).await;
    wait_for_view(b.as_ref(), &ids(&["b", "c"])).await;
    wait_until(|| b.core().is_primary()).await;

    assert_eq!(client.increment("x").await, "2");
    assert_eq!(value_of(b.as_ref(), "x"), Some(2));
    assert_eq!(value_of(c.as_ref(), "x"), Some(2));
}

// ============================================================
// PASSIVE REPLICATION
// ============================================================

async fn send_client_op(transport: &Arc<dyn Transport>, to: &str, operation: Operation, timestamp: u64) -> Option<String> {
    let op = ClientOp {
        operation,
        key: "x".to_string(),
        timestamp,
    };
    transport.send_request(&NodeId::new(to), &Request::Client(op)).await
}

#[tokio::test]
async fn test_checkpoint_carries_value_and_timestamp_to_backup() {
    let cluster = Cluster::new(cluster_config(
        ReplicationMode::Passive,
        &["p", "s"],
        SLOW_HEARTBEAT_MS,
        50,
    ));
    let p = cluster.join_passive("p").await;
    let s = cluster.join_passive("s").await;
    assert!(p.core().is_primary());

    let client: Arc<dyn Transport> = cluster.network.transport("client");
    let response = send_client_op(&client, "p", Operation::Increment, 200).await;
    assert_eq!(response.as_deref(), Some("1"));

    let forwarded = send_client_op(&client, "s", Operation::Increment, 200).await;
    assert_eq!(forwarded.as_deref(), Some(ACK));

    wait_until(|| value_of(s.as_ref(), "x") == Some(1) && s.buffered_len() == 0).await;
    assert!(s.buffered(&NodeId::new("client")).is_empty());

    // The checkpoint also told the backup the client is covered up to 200.
    send_client_op(&client, "s", Operation::Increment, 200).await;
    assert_eq!(s.buffered_len(), 0);
}

#[tokio::test]
async fn test_backup_replays_buffer_after_primary_crash() {
    let cluster = Cluster::new(cluster_config(ReplicationMode::Passive, &["p", "s"], 20, 100));
    let p = cluster.join_passive("p").await;
    let s = cluster.join_passive("s").await;
    let client: Arc<dyn Transport> = cluster.network.transport("client");

    send_client_op(&client, "p", Operation::Increment, 200).await;
    send_client_op(&client, "s", Operation::Increment, 200).await;
    wait_until(|| value_of(s.as_ref(), "x") == Some(1) && s.buffered_len() == 0).await;

    send_client_op(&client, "p", Operation::Increment, 300).await;
    send_client_op(&client, "s", Operation::Increment, 300).await;
    assert_eq!(value_of(p.as_ref(), "x"), Some(2));

    cluster.network.crash(&NodeId::new("p"));
    wait_until(|| cluster.authority.members() == ids(&["s"])).await;
    wait_until(|| s.core().is_primary()).await;

    assert_eq!(s.buffered_len(), 0);
    assert_eq!(value_of(s.as_ref(), "x"), Some(2));

    let passive_client = PassiveClient::new(cluster.network.transport("client-2"), NodeId::new(AUTHORITY));
    assert_eq!(passive_client.get("x").await, "2");
    assert_eq!(passive_client.increment("x").await, "3");
}

// ============================================================
// FAILURE DETECTION
// ============================================================

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<LivenessEvent>>,
}

impl EventLog {
    fn count(&self, event: &LivenessEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

#[async_trait]
impl LivenessSink for EventLog {
    async fn report(&self, event: LivenessEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn relay_node(
    network: &Arc<MemoryNetwork>,
    name: &str,
    parents: &[&str],
    children: &[&str],
    sink: Option<Arc<dyn LivenessSink>>,
) -> Arc<Node> {
    let detector = FailureDetector::new(network.transport(name), ids(parents), ids(children), 20, 3, sink);
    let node = Node::new(NodeId::new(name), detector, Role::Relay);
    network.register(node.id.clone(), node.clone());
    node.start();
    node
}

#[tokio::test]
async fn test_transitions_reach_the_root_once() {
    let network = MemoryNetwork::new();
    let log = Arc::new(EventLog::default());
    relay_node(&network, "root", &[], &["middle"], Some(log.clone()));
    relay_node(&network, "middle", &["root"], &["leaf"], None);
    relay_node(&network, "leaf", &["middle"], &[], None);

    let leaf_alive = LivenessEvent::Alive(NodeId::new("leaf"));
    let leaf_dead = LivenessEvent::Dead(NodeId::new("leaf"));
    let middle_alive = LivenessEvent::Alive(NodeId::new("middle"));
    let middle_dead = LivenessEvent::Dead(NodeId::new("middle"));

    wait_until(|| log.count(&leaf_alive) == 1 && log.count(&middle_alive) == 1).await;

    network.set_drop_datagrams(true);
    wait_until(|| log.count(&leaf_dead) == 1 && log.count(&middle_dead) == 1).await;

    network.set_drop_datagrams(false);
    wait_until(|| log.count(&leaf_alive) == 2 && log.count(&middle_alive) == 2).await;

    // Steady heartbeats produce no further transitions.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.count(&leaf_alive), 2);
    assert_eq!(log.count(&leaf_dead), 1);
    assert_eq!(log.count(&middle_alive), 2);
    assert_eq!(log.count(&middle_dead), 1);
}

#[tokio::test]
async fn test_authority_reconfigures_heartbeats_down_the_tree() {
    let cluster = Cluster::new(cluster_config(ReplicationMode::Active, &["a"], SLOW_HEARTBEAT_MS, 10_000));
    let node = Node::from_config(&cluster.config, cluster.network.transport("a"));
    cluster.start(node.clone());

    let operator = cluster.network.transport("operator");
    let response = operator
        .send_request(&NodeId::new(AUTHORITY), &Request::HeartbeatInterval(500))
        .await;
    assert_eq!(response.as_deref(), Some(ACK));

    assert_eq!(node.detector().heartbeat_interval(), Duration::from_millis(500));

    operator
        .send_request(&NodeId::new(AUTHORITY), &Request::CheckpointInterval(250))
        .await;
    let Role::Replica(replica) = node.role() else {
        panic!("a should be a replica");
    };
    assert_eq!(replica.core().checkpoint_interval(), Duration::from_millis(250));
}
