//! Membership Module Tests
//!
//! Validates failure detection and the membership authority.
//!
//! ## Test Scopes
//! - **Data Structures**: Identity semantics and datagram serialization.
//! - **Failure Detector**: Edge-triggered tolerance counters, relaying, reconfiguration.
//! - **Authority**: Insertion-ordered membership and broadcasts.

#[cfg(test)]
mod tests {
    use crate::membership::authority::MembershipAuthority;
    use crate::membership::detector::{FailureDetector, LivenessSink};
    use crate::membership::types::{Datagram, LivenessEvent, NodeId};
    use crate::transport::Endpoint;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::protocol::{ACK, Request};

    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Acknowledges everything and remembers what it was sent.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<(NodeId, Request)>>,
    }

    impl Recorder {
        fn received(&self) -> Vec<Request> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(_, request)| request.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Endpoint for Recorder {
        async fn handle_request(&self, source: NodeId, request: Request) -> String {
            self.requests.lock().unwrap().push((source, request));
            ACK.to_string()
        }

        async fn handle_message(&self, _datagram: Datagram) {}
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|name| NodeId::new(*name)).collect()
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::random();
        let id2 = NodeId::random();

        assert_ne!(id1, id2, "Each generated NodeId should be unique");
    }

    #[test]
    fn test_node_id_equality() {
        let id1 = NodeId::new("replica-1");
        let id2: NodeId = "replica-1".into();
        let id3 = NodeId::new("replica-2");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_eq!(id1.to_string(), "replica-1");
    }

    #[test]
    fn test_heartbeat_serialization() {
        let heartbeat = Datagram::Heartbeat {
            from: NodeId::new("leaf"),
        };

        let encoded = bincode::serialize(&heartbeat).unwrap();
        let decoded: Datagram = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded, heartbeat);
        assert_eq!(decoded.sender(), &NodeId::new("leaf"));
    }

    // ============================================================
    // FAILURE DETECTOR TESTS
    // ============================================================

    fn detector_with_children(children: &[&str], tolerance: i64) -> Arc<FailureDetector> {
        let network = MemoryNetwork::new();
        FailureDetector::new(network.transport("parent"), vec![], ids(children), 200, tolerance, None)
    }

    #[test]
    fn test_first_heartbeat_revives_child() {
        let detector = detector_with_children(&["child"], 3);
        let child = NodeId::new("child");

        assert_eq!(detector.tolerance_of(&child), Some(0));
        assert!(detector.record_heartbeat(&child));
        assert_eq!(detector.tolerance_of(&child), Some(3));

        // Subsequent heartbeats only refill the counter.
        assert!(!detector.record_heartbeat(&child));
        assert!(!detector.record_heartbeat(&child));
    }

    #[test]
    fn test_dead_is_reported_exactly_once() {
        let detector = detector_with_children(&["child"], 2);
        let child = NodeId::new("child");
        detector.record_heartbeat(&child);

        assert!(detector.decay_tolerances().is_empty());
        assert_eq!(detector.decay_tolerances(), vec![child.clone()]);
        assert!(detector.decay_tolerances().is_empty());
        assert!(detector.decay_tolerances().is_empty());
        assert_eq!(detector.tolerance_of(&child), Some(0));
    }

    #[test]
    fn test_resumed_heartbeats_revive_once() {
        let detector = detector_with_children(&["child"], 1);
        let child = NodeId::new("child");
        detector.record_heartbeat(&child);
        assert_eq!(detector.decay_tolerances(), vec![child.clone()]);

        let revivals = (0..5).filter(|_| detector.record_heartbeat(&child)).count();

        assert_eq!(revivals, 1);
    }

    #[test]
    fn test_heartbeat_from_stranger_is_ignored() {
        let detector = detector_with_children(&["child"], 3);

        assert!(!detector.record_heartbeat(&NodeId::new("stranger")));
        assert_eq!(detector.tolerance_of(&NodeId::new("stranger")), None);
    }

    #[tokio::test]
    async fn test_transitions_are_relayed_to_parents() {
        let network = MemoryNetwork::new();
        let root = Arc::new(Recorder::default());
        network.register(NodeId::new("root"), root.clone());

        let detector = FailureDetector::new(
            network.transport("middle"),
            ids(&["root"]),
            ids(&["leaf"]),
            200,
            3,
            None,
        );

        detector.propagate(LivenessEvent::Dead(NodeId::new("leaf"))).await;

        assert_eq!(root.received(), vec![Request::Dead(NodeId::new("leaf"))]);
    }

    #[tokio::test]
    async fn test_root_delivers_to_its_sink() {
        let network = MemoryNetwork::new();
        let authority = MembershipAuthority::new(network.transport("authority"), ids(&["r1"]));
        let sink: Arc<dyn LivenessSink> = authority.clone();
        let detector =
            FailureDetector::new(network.transport("authority"), vec![], ids(&["r1"]), 200, 3, Some(sink));

        detector
            .handle_heartbeat(Datagram::Heartbeat {
                from: NodeId::new("r1"),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(authority.members(), ids(&["r1"]));
    }

    #[tokio::test]
    async fn test_interval_reconfiguration_reaches_children() {
        let network = MemoryNetwork::new();
        let child = Arc::new(Recorder::default());
        network.register(NodeId::new("child"), child.clone());
        let detector =
            FailureDetector::new(network.transport("parent"), vec![], ids(&["child"]), 200, 3, None);

        detector.set_heartbeat_interval(50).await;
        detector.set_heartbeat_interval(400).await;
        detector.set_heartbeat_tolerance(5).await;

        assert_eq!(detector.heartbeat_interval(), Duration::from_millis(400));
        assert_eq!(detector.heartbeat_tolerance(), 5);
        assert_eq!(
            child.received(),
            vec![
                Request::HeartbeatInterval(50),
                Request::HeartbeatInterval(400),
                Request::HeartbeatTolerance(5),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_positive_reconfiguration_is_ignored() {
        let network = MemoryNetwork::new();
        let child = Arc::new(Recorder::default());
        network.register(NodeId::new("child"), child.clone());
        let detector =
            FailureDetector::new(network.transport("parent"), vec![], ids(&["child"]), 200, 3, None);

        detector.set_heartbeat_interval(0).await;
        detector.set_heartbeat_tolerance(-1).await;

        assert_eq!(detector.heartbeat_interval(), Duration::from_millis(200));
        assert_eq!(detector.heartbeat_tolerance(), 3);
        assert!(child.received().is_empty());
    }

    // ============================================================
    // AUTHORITY TESTS
    // ============================================================

    #[test]
    fn test_membership_keeps_join_order() {
        let network = MemoryNetwork::new();
        let authority =
            MembershipAuthority::new(network.transport("authority"), ids(&["a", "b", "c"]));

        assert!(authority.apply(&LivenessEvent::Alive(NodeId::new("b"))));
        assert!(authority.apply(&LivenessEvent::Alive(NodeId::new("a"))));
        assert!(!authority.apply(&LivenessEvent::Alive(NodeId::new("b"))));
        assert_eq!(authority.members(), ids(&["b", "a"]));

        assert!(authority.apply(&LivenessEvent::Dead(NodeId::new("b"))));
        assert!(!authority.apply(&LivenessEvent::Dead(NodeId::new("b"))));
        assert_eq!(authority.members(), ids(&["a"]));

        // A revived node rejoins at the end.
        assert!(authority.apply(&LivenessEvent::Alive(NodeId::new("b"))));
        assert_eq!(authority.members(), ids(&["a", "b"]));
    }

    #[test]
    fn test_unknown_nodes_are_not_members() {
        let network = MemoryNetwork::new();
        let authority = MembershipAuthority::new(network.transport("authority"), ids(&["a"]));

        assert!(!authority.apply(&LivenessEvent::Alive(NodeId::new("detector-1"))));
        assert!(authority.members().is_empty());
    }

    #[tokio::test]
    async fn test_change_is_broadcast_to_new_membership() {
        let network = MemoryNetwork::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        network.register(NodeId::new("a"), a.clone());
        network.register(NodeId::new("b"), b.clone());
        let authority = MembershipAuthority::new(network.transport("authority"), ids(&["a", "b"]));

        authority.report(LivenessEvent::Alive(NodeId::new("a"))).await;
        authority.report(LivenessEvent::Alive(NodeId::new("b"))).await;
        authority.report(LivenessEvent::Dead(NodeId::new("a"))).await;
        // No change, no broadcast.
        authority.report(LivenessEvent::Dead(NodeId::new("a"))).await;

        assert_eq!(
            a.received(),
            vec![
                Request::Membership(ids(&["a"])),
                Request::Membership(ids(&["a", "b"])),
            ]
        );
        assert_eq!(
            b.received(),
            vec![
                Request::Membership(ids(&["a", "b"])),
                Request::Membership(ids(&["b"])),
            ]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_interval_reaches_all_replicas() {
        let network = MemoryNetwork::new();
        let a = Arc::new(Recorder::default());
        network.register(NodeId::new("a"), a.clone());
        let authority = MembershipAuthority::new(network.transport("authority"), ids(&["a"]));

        authority.set_checkpoint_interval(250).await;

        assert_eq!(a.received(), vec![Request::CheckpointInterval(250)]);
    }
}
