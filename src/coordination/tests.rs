//! Coordination Module Tests
//!
//! Whole-server behaviour: single services driven through `dispatch` and the
//! public operations, and small clusters of services on loopback ports with
//! discovery disabled.
//!
//! ## Test Scopes
//! - **Dispatch**: client vs peer origin, idempotent outages, store outages.
//! - **Operations**: verification relay, operator resolution, status snapshots.
//! - **Cluster**: report replication and the `JOIN` catch-up handshake.

#[cfg(test)]
mod tests {
    use crate::config::{CoordinationConfig, PeerConfig};
    use crate::coordination::{CoordinationService, Origin};
    use crate::membership::types::ServerId;
    use crate::protocol::message::{ACK_OUTAGE, ACK_REPORT, JOINED, Message, Reply};
    use crate::store::backend::NodeStore;
    use crate::store::memory::MemoryStore;
    use crate::store::types::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(id: u32) -> CoordinationConfig {
        let mut config = CoordinationConfig::default();
        config.server_id = id;
        config.bind_host = "127.0.0.1".to_string();
        config.tcp_port = 0;
        config.discovery.enabled = false;
        config.replication.retry_delay_ms = 50;
        config.delivery.retry_delay_ms = 50;
        config
    }

    fn service(id: u32) -> (Arc<CoordinationService>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = CoordinationService::new(config(id), store.clone()).unwrap();
        (service, store)
    }

    fn report(node_id: &str, power_state: PowerState) -> NodeReport {
        NodeReport {
            node_id: node_id.to_string(),
            voltage: 220.0,
            power_state,
            region: "East".to_string(),
        }
    }

    fn peer_origin() -> Origin {
        Origin::Peer {
            remote: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    async fn wait_until(check: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn wait_for_node(store: &MemoryStore, node_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if store.get_node(node_id).await.unwrap().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    // ============================================================
    // DISPATCH TESTS
    // ============================================================

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config(1);
        config.detector.offline_after_ms = config.detector.suspect_after_ms;

        assert!(CoordinationService::new(config, Arc::new(MemoryStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_client_report_ticks_clock_and_records_power_events() {
        let (service, store) = service(1);

        assert_eq!(
            service.submit_report(report("node-1", PowerState::Normal)).await,
            Reply::Ack(ACK_REPORT)
        );
        assert_eq!(
            service.submit_report(report("node-1", PowerState::Outage)).await,
            Reply::Ack(ACK_REPORT)
        );

        let events = store.list_events(Some("node-1"), 10).await.unwrap();
        let mut types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        types.sort();
        assert_eq!(types, vec!["OUTAGE_START", "POWER_RESTORED"]);
        assert!(service.clock().peek() >= 4);
    }

    #[tokio::test]
    async fn test_synced_report_observes_clock_without_events() {
        let (service, store) = service(1);
        let line = Message::parse("SYNC|100|REPORT|node-2|219|OUTAGE|West").unwrap();

        assert_eq!(service.dispatch(line, peer_origin()).await, Reply::Ack(ACK_REPORT));

        let node = store.get_node("node-2").await.unwrap().unwrap();
        assert_eq!(node.logical_timestamp, 100);
        assert_eq!(service.clock().peek(), 101);
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_late_replicated_report_does_not_roll_back() {
        let (service, store) = service(2);
        let newer = Message::parse("SYNC|50|REPORT|node-x|0|OUTAGE|East").unwrap();
        service.dispatch(newer, peer_origin()).await;

        // A retried push from earlier arrives last.
        let late = Message::parse("SYNC|3|REPORT|node-x|221.0|NORMAL|East").unwrap();
        assert_eq!(service.dispatch(late, peer_origin()).await, Reply::Ack(ACK_REPORT));

        let node = store.get_node("node-x").await.unwrap().unwrap();
        assert_eq!(node.power_state, PowerState::Outage);
        assert_eq!(node.voltage, 0.0);
        assert_eq!(node.logical_timestamp, 50);

        // A direct report ticks past every observed stamp and wins.
        service
            .submit_report(report("node-x", PowerState::Normal))
            .await;
        let node = store.get_node("node-x").await.unwrap().unwrap();
        assert_eq!(node.power_state, PowerState::Normal);
        assert!(node.logical_timestamp > 50);
    }

    #[tokio::test]
    async fn test_outage_replay_is_idempotent() {
        let (service, store) = service(1);
        service
            .submit_report(report("node-1", PowerState::Normal))
            .await;
        let events_before = store.event_count();

        let line = "OUTAGE|evt-42|node-1|OUTAGE_START|2025-01-15T10:30:00Z|{\"cause\":\"storm\"}";
        let Message::Outage(notice) = Message::parse(line).unwrap() else {
            panic!("expected OUTAGE");
        };

        assert_eq!(service.submit_outage(notice.clone()).await, Reply::Ack(ACK_OUTAGE));
        assert_eq!(service.submit_outage(notice.clone()).await, Reply::Ack(ACK_OUTAGE));
        let synced = Message::Sync {
            clock: Some(7),
            inner: Box::new(Message::Outage(notice)),
        };
        assert_eq!(service.dispatch(synced, peer_origin()).await, Reply::Ack(ACK_OUTAGE));

        assert_eq!(store.event_count(), events_before + 1);
        let node = store.get_node("node-1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Outage);
        assert_eq!(node.power_state, PowerState::Outage);
    }

    #[tokio::test]
    async fn test_outage_end_restores_power() {
        let (service, store) = service(1);
        service
            .submit_report(report("node-1", PowerState::Outage))
            .await;

        let end = CoordinationService::new_outage("node-1", "OUTAGE_END", "{}");
        assert_eq!(service.submit_outage(end).await, Reply::Ack(ACK_OUTAGE));

        let node = store.get_node("node-1").await.unwrap().unwrap();
        assert_eq!(node.power_state, PowerState::Normal);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_persisted() {
        let (service, store) = service(1);
        store.set_available(false);

        let reply = service.submit_report(report("node-1", PowerState::Normal)).await;

        assert_eq!(reply, Reply::AckNotPersisted(ACK_REPORT));
        assert_eq!(reply.to_string(), "OK|ACK_REPORT|NOT_PERSISTED");
    }

    #[tokio::test]
    async fn test_peer_status_is_adopted() {
        let (service, store) = service(1);
        service
            .submit_report(report("node-1", PowerState::Normal))
            .await;

        let line = Message::parse("SYNC|5|STATUS|node-1|OFFLINE").unwrap();
        assert_eq!(service.dispatch(line, peer_origin()).await, Reply::Ok);

        let node = store.get_node("node-1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
    }

    // ============================================================
    // OPERATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_join_substitutes_wildcard_host_and_ignores_self() {
        let (service, _) = service(1);
        let remote = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));

        assert_eq!(
            service.handle_join(ServerId(3), "0", 5003, remote),
            Reply::Ack(JOINED)
        );
        let peers = service.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "10.0.0.7");
        assert_eq!(peers[0].port, 5003);

        assert!(!service.handle_join(ServerId(1), "127.0.0.1", 5001, None).is_ok());
        assert_eq!(service.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_relay_is_queued_until_node_connects() {
        let (service, store) = service(1);
        service
            .submit_report(report("node-1", PowerState::Off))
            .await;

        let relay = Message::parse("SYNC|3|VERIFY_RELAY|node-1").unwrap();
        assert_eq!(service.dispatch(relay, peer_origin()).await, Reply::Ok);

        let (tx, mut rx) = mpsc::unbounded_channel();
        service.bind_session("node-1", 1, tx);
        assert_eq!(rx.recv().await.as_deref(), Some("SOLVED_CHECK"));
        assert!(service.take_pending_commands("node-1").is_empty());

        assert!(service.trigger_verification("node-1").await.unwrap());
        assert_eq!(rx.recv().await.as_deref(), Some("SOLVED_CHECK"));
        let node = store.get_node("node-1").await.unwrap().unwrap();
        assert_eq!(node.verification, VerificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_unbind_only_removes_own_session() {
        let (service, _) = service(1);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();

        service.bind_session("node-1", 1, old_tx);
        service.bind_session("node-1", 2, new_tx);
        service.unbind_session("node-1", 1);

        assert!(service.is_connected("node-1"));
        service.unbind_session("node-1", 2);
        assert!(!service.is_connected("node-1"));
    }

    #[tokio::test]
    async fn test_mark_resolved_records_operator() {
        let (service, store) = service(1);
        service
            .submit_report(report("node-1", PowerState::Outage))
            .await;

        assert!(service.mark_resolved("node-1", "alice").await.is_ok());

        let node = service.node_details("node-1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.power_state, PowerState::Normal);
        assert_eq!(node.verification, VerificationStatus::Confirmed);

        let events = store.list_events(Some("node-1"), 10).await.unwrap();
        let restored = events
            .iter()
            .find(|e| e.event_type == "STATUS_RESTORED")
            .expect("resolution event");
        assert!(restored.metadata.contains("alice"));
    }

    #[tokio::test]
    async fn test_unknown_node_details_is_not_found() {
        let (service, _) = service(1);

        assert!(matches!(
            service.node_details("ghost").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cluster_status_and_stats() {
        let (service, _) = service(1);
        service
            .submit_report(report("node-1", PowerState::Normal))
            .await;
        service
            .submit_report(report("node-2", PowerState::Offline))
            .await;

        let status = service.cluster_status().await.unwrap();
        assert_eq!(status.server_id, ServerId(1));
        assert_eq!(status.online, 1);
        assert_eq!(status.offline, 1);
        assert_eq!(status.known_peers, 0);

        let stats = service.server_stats();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.connected_nodes, 0);
        assert_eq!(service.all_nodes().await.unwrap().len(), 2);
        assert_eq!(service.recent_events(1).await.unwrap().len(), 1);
        let node_2_events = service.node_events("node-2", 10).await.unwrap();
        assert!(node_2_events.iter().all(|e| e.node_id == "node-2"));
    }

    // ============================================================
    // CLUSTER TESTS
    // ============================================================

    async fn pinned_to(id: u32, peer_id: u32, peer_port: u16) -> (Arc<CoordinationService>, Arc<MemoryStore>) {
        let mut config = config(id);
        config.peers.push(PeerConfig {
            id: peer_id,
            host: "127.0.0.1".to_string(),
            port: peer_port,
        });
        let store = Arc::new(MemoryStore::new());
        let service = CoordinationService::new(config, store.clone()).unwrap();
        service.start().await.unwrap();
        (service, store)
    }

    /// The replica-visible part of a row.
    fn replicated_view(node: &MonitoredNode) -> (String, String, f64, PowerState, NodeStatus) {
        (
            node.node_id.clone(),
            node.region.clone(),
            node.voltage,
            node.power_state.clone(),
            node.status,
        )
    }

    #[tokio::test]
    async fn test_report_replicates_between_pinned_peers() {
        let (b, b_store) = service(2);
        let b_addr = b.start().await.unwrap();
        let (a, a_store) = pinned_to(1, 2, b_addr.port()).await;

        // B learns about A through the JOIN handshake.
        assert!(wait_until(|| !b.peers().is_empty()).await);

        let line = Message::parse("REPORT|nodeX|221.0|NORMAL|East").unwrap();
        assert_eq!(a.dispatch(line, Origin::Client).await, Reply::Ack(ACK_REPORT));
        assert!(wait_for_node(&b_store, "nodeX").await);

        let replica = b_store.get_node("nodeX").await.unwrap().unwrap();
        assert_eq!(replica.status, NodeStatus::Online);
        assert_eq!(replica.voltage, 221.0);
        assert_eq!(replica.region, "East");
        assert_eq!(replica.power_state, PowerState::Normal);
        assert!(b.clock().peek() > 1);

        b.submit_report(report("node-2", PowerState::Low)).await;
        assert!(wait_for_node(&a_store, "node-2").await);
        let replica = a_store.get_node("node-2").await.unwrap().unwrap();
        assert_eq!(replica.power_state, PowerState::Low);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_catches_up_new_server() {
        let (a, a_store) = service(1);
        let regions = ["East", "West", "North", "South", "Center"];
        for (i, region) in regions.iter().enumerate() {
            let power_state = if i == 4 { PowerState::Low } else { PowerState::Normal };
            a.submit_report(NodeReport {
                node_id: format!("node-{}", i),
                voltage: 218.0 + i as f64,
                power_state,
                region: region.to_string(),
            })
            .await;
        }
        a_store
            .set_status("node-2", NodeStatus::Suspected, now_ms())
            .await
            .unwrap();
        let expected: Vec<_> = a_store
            .list_nodes()
            .await
            .unwrap()
            .iter()
            .map(replicated_view)
            .collect();
        assert_eq!(expected.len(), 5);
        let a_addr = a.start().await.unwrap();

        let (b, b_store) = pinned_to(2, 1, a_addr.port()).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut replicated = Vec::new();
        while tokio::time::Instant::now() < deadline {
            replicated = b_store
                .list_nodes()
                .await
                .unwrap()
                .iter()
                .map(replicated_view)
                .collect();
            if replicated == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(replicated, expected);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicated_report_is_not_forwarded() {
        // A - B - C in a line: A and C each know only B.
        let (b, b_store) = service(2);
        let b_addr = b.start().await.unwrap();
        let (a, _) = pinned_to(1, 2, b_addr.port()).await;
        let (c, c_store) = pinned_to(3, 2, b_addr.port()).await;

        assert!(wait_until(|| b.peers().len() == 2).await);
        // Let the empty handshake syncs drain.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.peers().len(), 1);
        assert_eq!(c.peers().len(), 1);

        a.submit_report(report("node-1", PowerState::Normal)).await;
        assert!(wait_for_node(&b_store, "node-1").await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(c_store.get_node("node-1").await.unwrap().is_none());

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }
}
