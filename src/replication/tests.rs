//! Replication Module Tests
//!
//! Runs the broadcaster against loopback "peers" that authenticate like an HQ
//! server and record every line they receive.
//!
//! ## Test Scopes
//! - **Broadcast**: every known peer receives the clock-stamped `SYNC` line.
//! - **Full sync**: one `REPORT` + `STATUS` pair per stored node.
//! - **Join**: `JOIN` is acknowledged through reliable delivery.
//! - **Failure**: unreachable peers exhaust their retries without blocking the caller.

#[cfg(test)]
mod tests {
    use crate::clock::LogicalClock;
    use crate::membership::registry::PeerRegistry;
    use crate::membership::types::{Peer, ServerId};
    use crate::network::fault::FaultInjector;
    use crate::network::reliable::{DeliveryPolicy, ReliableDelivery};
    use crate::network::transport::{Endpoint, TcpTransport};
    use crate::protocol::message::Message;
    use crate::replication::broadcaster::{ReplicationBroadcaster, ReplicationSettings};
    use crate::store::backend::NodeStore;
    use crate::store::memory::MemoryStore;
    use crate::store::types::{NodeReport, NodeStatus, PowerState};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    const PEER_TOKEN: &str = "SERVER_2025";

    fn settings() -> ReplicationSettings {
        ReplicationSettings {
            attempts: 2,
            retry_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_millis(500),
        }
    }

    fn broadcaster(
        registry: Arc<PeerRegistry>,
        store: Arc<dyn NodeStore>,
    ) -> Arc<ReplicationBroadcaster> {
        let transport = TcpTransport::new(PEER_TOKEN, Duration::from_millis(500))
            .with_injector(Arc::new(FaultInjector::new()));
        let delivery = ReliableDelivery::new(
            Arc::new(transport),
            DeliveryPolicy {
                attempts: 2,
                retry_delay: Duration::from_millis(20),
                ack_timeout: Duration::from_millis(500),
            },
        );

        ReplicationBroadcaster::new(
            ServerId(1),
            registry,
            Arc::new(LogicalClock::new()),
            store,
            PEER_TOKEN,
            settings(),
            delivery,
            TaskTracker::new(),
            CancellationToken::new(),
        )
    }

    /// Loopback peer: answers `AUTH` and `JOIN`, forwards every other line.
    async fn recording_peer(id: u32) -> (Peer, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();

                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();

                    let Ok(Some(auth)) = lines.next_line().await else {
                        return;
                    };
                    if auth != format!("AUTH|{}", PEER_TOKEN) {
                        let _ = write_half.write_all(b"ERR|AUTH_FAILED\n").await;
                        return;
                    }
                    let _ = write_half.write_all(b"AUTH_OK\n").await;

                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.starts_with("JOIN|") {
                            let _ = write_half.write_all(b"OK|JOINED\n").await;
                        }
                        let _ = tx.send(line);
                    }
                });
            }
        });

        let peer = Peer {
            id: ServerId(id),
            host: "127.0.0.1".to_string(),
            port,
            claims_leader: false,
        };
        (peer, rx)
    }

    async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("peer received nothing")
            .expect("peer channel closed")
    }

    async fn seed(store: &MemoryStore, count: usize) {
        for i in 0..count {
            store
                .apply_report(
                    &NodeReport {
                        node_id: format!("node-{}", i),
                        voltage: 220.0 + i as f64,
                        power_state: PowerState::Normal,
                        region: "East".to_string(),
                    },
                    1_000,
                    i as i64,
                )
                .await
                .unwrap();
        }
    }

    // ============================================================
    // BROADCAST TESTS
    // ============================================================

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let registry = Arc::new(PeerRegistry::default());
        let (peer_a, mut rx_a) = recording_peer(2).await;
        let (peer_b, mut rx_b) = recording_peer(3).await;
        registry.register_discovered(peer_a);
        registry.register_pinned(peer_b.id, &peer_b.host, peer_b.port);

        let broadcaster = broadcaster(registry, Arc::new(MemoryStore::new()));
        let started = broadcaster.broadcast("REPORT|node-1|220|NORMAL|East");

        assert_eq!(started, 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let line = next_line(rx).await;
            let Message::Sync { clock, inner } = Message::parse(&line).unwrap() else {
                panic!("expected SYNC, got {}", line);
            };
            assert_eq!(clock, Some(1));
            assert_eq!(inner.node_id(), Some("node-1"));
        }

        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_is_noop() {
        let broadcaster = broadcaster(Arc::new(PeerRegistry::default()), Arc::new(MemoryStore::new()));

        assert_eq!(broadcaster.broadcast("CONFIRM_RESOLVED|node-1"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_block_broadcast() {
        let registry = Arc::new(PeerRegistry::default());
        // Bind and drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        registry.register_pinned(ServerId(9), "127.0.0.1", port);

        let broadcaster = broadcaster(registry, Arc::new(MemoryStore::new()));
        let started = tokio::time::Instant::now();
        assert_eq!(broadcaster.broadcast("CONFIRM_RESOLVED|node-1"), 1);
        assert!(started.elapsed() < Duration::from_millis(50));

        // Both attempts fail quickly; shutdown waits for the task to finish.
        tokio::time::timeout(Duration::from_secs(3), broadcaster.shutdown())
            .await
            .expect("retry task did not finish");
    }

    // ============================================================
    // FULL SYNC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_full_sync_sends_report_and_status_per_node() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 5).await;
        store
            .set_status("node-3", NodeStatus::Suspected, 2_000)
            .await
            .unwrap();

        let (peer, mut rx) = recording_peer(2).await;
        let broadcaster = broadcaster(Arc::new(PeerRegistry::default()), store);

        let sent = broadcaster.sync_full_state_to(&peer).await.unwrap();
        assert_eq!(sent, 5);

        let mut reports = 0;
        let mut suspected = 0;
        for _ in 0..10 {
            let line = next_line(&mut rx).await;
            let Message::Sync { inner, .. } = Message::parse(&line).unwrap() else {
                panic!("expected SYNC, got {}", line);
            };
            match *inner {
                Message::Report(_) => reports += 1,
                Message::Status {
                    status: NodeStatus::Suspected,
                    ..
                } => suspected += 1,
                Message::Status { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(reports, 5);
        assert_eq!(suspected, 1);
    }

    #[tokio::test]
    async fn test_full_sync_to_unreachable_peer_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let peer = Peer {
            id: ServerId(4),
            host: "127.0.0.1".to_string(),
            port,
            claims_leader: false,
        };

        let broadcaster = broadcaster(Arc::new(PeerRegistry::default()), Arc::new(MemoryStore::new()));

        assert!(broadcaster.sync_full_state_to(&peer).await.is_err());
    }

    // ============================================================
    // JOIN TESTS
    // ============================================================

    #[tokio::test]
    async fn test_join_is_acknowledged() {
        let (peer, mut rx) = recording_peer(2).await;
        let broadcaster = broadcaster(Arc::new(PeerRegistry::default()), Arc::new(MemoryStore::new()));

        let delivery = broadcaster
            .join(&peer, &Endpoint::new("127.0.0.1", 5001))
            .await
            .unwrap();

        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.reply, "OK|JOINED");
        assert_eq!(next_line(&mut rx).await, "JOIN|1|127.0.0.1|5001");
    }

    #[tokio::test]
    async fn test_join_handshake_pushes_state_then_joins() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1).await;
        let (peer, mut rx) = recording_peer(2).await;
        let broadcaster = broadcaster(Arc::new(PeerRegistry::default()), store);

        broadcaster.spawn_join_handshake(peer, Endpoint::new("127.0.0.1", 5001));

        // Sync and JOIN use separate connections, so arrival order may interleave.
        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(next_line(&mut rx).await);
        }

        assert!(lines.iter().any(|l| l.contains("REPORT|node-0")));
        assert!(lines.iter().any(|l| l.contains("STATUS|node-0|ONLINE")));
        assert!(lines.iter().any(|l| l.starts_with("JOIN|1|")));

        broadcaster.shutdown().await;
    }
}
