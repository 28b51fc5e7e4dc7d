pub mod node;
pub mod sim;
pub mod transport;

pub use node::*;
pub use sim::*;
pub use transport::*;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::common::{Config, NodeId, ServentError};

/*
    Servents are connected by point-to-point links that deliver every message
    eventually, with no bound on the delay and, in causal mode, no ordering
    between messages on the same link. A broadcast is the sender putting one
    copy on each link to its neighbors; outside a clique every servent passes
    a broadcast on to its own neighbors the first time it sees it.
*/

/// A whole system of servents on one simulated network.
pub struct Cluster {
    pub network: Arc<SimNetwork>,
    pub servents: Vec<Arc<Servent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn start(config: Config) -> Result<Self, ServentError> {
        config.validate()?;
        let config = Arc::new(config);
        let (network, inboxes) = SimNetwork::new(&config);

        let mut servents = Vec::with_capacity(config.node_count);
        let mut tasks = Vec::new();
        for inbox in inboxes {
            let servent = Servent::new(config.clone(), inbox.me, network.endpoint(inbox.me))?;
            tasks.extend(servent.start(inbox));
            servents.push(servent);
        }
        servents.sort_by_key(|servent| servent.me());

        info!(
            nodes = config.node_count,
            delivery = ?config.delivery,
            snapshot = ?config.snapshot,
            "cluster started"
        );
        Ok(Cluster {
            network,
            servents,
            tasks,
        })
    }

    pub fn servent(&self, id: NodeId) -> &Arc<Servent> {
        &self.servents[id as usize]
    }

    pub fn total_balance(&self) -> i64 {
        self.servents.iter().map(|servent| servent.bitcake.current()).sum()
    }

    /// Waits until nothing is in flight, every pending buffer is empty and no
    /// follow-up is running, for a few checks in a row.
    pub async fn settle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut quiet = 0;

        while Instant::now() < deadline {
            let idle = self.network.in_flight() == 0 && self.servents.iter().all(|servent| servent.is_idle());
            quiet = if idle { quiet + 1 } else { 0 };
            if quiet >= 3 {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn shutdown(self) {
        for servent in &self.servents {
            servent.stop();
        }
        self.network.shutdown();

        for task in self.tasks {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("servent task didn't stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::bitcake::BurstPlan;
    use crate::common::{DeliveryMode, ServentConfig, SnapshotKind};
    use crate::snapshot::{Algorithm, CoordinatedCheckpointing, SnapshotReport};

    fn config(nodes: usize, delivery: DeliveryMode, snapshot: SnapshotKind) -> Config {
        Config::clique(nodes, delivery, snapshot)
            .with_delays(1, 5)
            .with_poll_interval(50)
    }

    async fn wait_report(servent: &Servent) -> SnapshotReport {
        let mut reports = servent.collector.subscribe();
        let report = timeout(Duration::from_secs(10), reports.wait_for(Option::is_some))
            .await
            .expect("snapshot timed out")
            .expect("collector gone")
            .clone();
        report.expect("report present")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    fn checkpointing(servent: &Servent) -> Arc<CoordinatedCheckpointing> {
        match &servent.algorithm {
            Algorithm::CoordinatedCheckpointing(cc) => cc.clone(),
            _ => unreachable!(),
        }
    }

    async fn burst_everywhere(cluster: &Cluster) -> Vec<JoinHandle<()>> {
        cluster
            .servents
            .iter()
            .map(|servent| {
                let servent = servent.clone();
                tokio::spawn(async move { servent.burst(BurstPlan::default()).await })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acharya_badrinath_during_bursts() {
        // Arrange
        let cluster = Cluster::start(config(3, DeliveryMode::Causal, SnapshotKind::AcharyaBadrinath)).unwrap();
        let bursts = burst_everywhere(&cluster).await;

        // Act
        cluster.servent(0).start_snapshot().unwrap();
        for burst in bursts {
            burst.await.unwrap();
        }
        let report = wait_report(cluster.servent(0)).await;

        // Assert
        assert_eq!(report.kind, SnapshotKind::AcharyaBadrinath);
        assert_eq!(report.balances.len(), 3);
        assert_eq!(report.total, 3000);

        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.total_balance(), 3000);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acharya_badrinath_counts_transfer_in_transit() {
        // Arrange: 1 -> 2 transfer stuck on the wire while 0 takes the snapshot
        let cluster = Cluster::start(config(3, DeliveryMode::Causal, SnapshotKind::AcharyaBadrinath)).unwrap();
        cluster.network.hold_link(1, 0);
        cluster.network.hold_link(1, 2);
        cluster.servent(1).send_transaction(2, 50).unwrap();

        // Act
        cluster.servent(0).start_snapshot().unwrap();
        let initiator = cluster.servent(0).clone();
        wait_until(|| initiator.engine.clock_values().get(&0) == Some(&1)).await;
        cluster.network.release_link(1, 0);
        let report = wait_report(cluster.servent(0)).await;

        // Assert
        assert_eq!(report.balances, BTreeMap::from([(0, 1000), (1, 950), (2, 1000)]));
        assert_eq!(report.in_transit, 50);
        assert_eq!(report.total, 3000);

        cluster.network.release_link(1, 2);
        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.servent(2).bitcake.current(), 1050);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acharya_badrinath_over_fifo_links() {
        let cluster = Cluster::start(config(3, DeliveryMode::Fifo, SnapshotKind::AcharyaBadrinath)).unwrap();
        let bursts = burst_everywhere(&cluster).await;

        cluster.servent(2).start_snapshot().unwrap();
        for burst in bursts {
            burst.await.unwrap();
        }
        let report = wait_report(cluster.servent(2)).await;

        assert_eq!(report.total, 3000);
        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.total_balance(), 3000);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_acharya_badrinath_on_ring_floods_broadcasts() {
        // Arrange: 0 - 1 - 2 - 3 - 0
        let mut ring = config(4, DeliveryMode::Causal, SnapshotKind::AcharyaBadrinath);
        ring.clique = false;
        ring.servents = (0..4)
            .map(|id| ServentConfig {
                id,
                neighbors: vec![(id + 3) % 4, (id + 1) % 4],
            })
            .collect();
        let cluster = Cluster::start(ring).unwrap();
        let bursts = burst_everywhere(&cluster).await;

        // Act
        cluster.servent(0).start_snapshot().unwrap();
        for burst in bursts {
            burst.await.unwrap();
        }
        let report = wait_report(cluster.servent(0)).await;

        // Assert
        assert_eq!(report.balances.len(), 4);
        assert_eq!(report.total, 4000);
        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.total_balance(), 4000);
        cluster.shutdown().await;
    }

    async fn alagar_venkatesan_totals_add_up(delivery: DeliveryMode) {
        // Arrange
        let cluster = Cluster::start(config(3, delivery, SnapshotKind::AlagarVenkatesan)).unwrap();
        let bursts = burst_everywhere(&cluster).await;

        // Act
        cluster.servent(0).start_snapshot().unwrap();
        for burst in bursts {
            burst.await.unwrap();
        }
        let report = wait_report(cluster.servent(0)).await;
        assert!(cluster.settle(Duration::from_secs(10)).await);

        // Assert
        assert_eq!(report.kind, SnapshotKind::AlagarVenkatesan);
        let totals: i64 = cluster
            .servents
            .iter()
            .map(|servent| match &servent.algorithm {
                Algorithm::AlagarVenkatesan(av) => av.last_total().expect("terminated"),
                _ => unreachable!(),
            })
            .sum();
        assert_eq!(totals, 3000);
        assert_eq!(cluster.total_balance(), 3000);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alagar_venkatesan_totals_add_up() {
        alagar_venkatesan_totals_add_up(DeliveryMode::Causal).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alagar_venkatesan_over_fifo_links() {
        alagar_venkatesan_totals_add_up(DeliveryMode::Fifo).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinated_checkpointing_freezes_transfers() {
        // Arrange: keep 0's requests on the wire until it has tried to pay 1
        let cluster = Cluster::start(config(3, DeliveryMode::Causal, SnapshotKind::CoordinatedCheckpointing)).unwrap();
        cluster.network.hold_link(0, 1);
        cluster.network.hold_link(0, 2);
        let initiator = cluster.servent(0).clone();
        let cc = checkpointing(&initiator);

        // Act
        initiator.start_snapshot().unwrap();
        wait_until(|| cc.is_frozen()).await;
        initiator.send_transaction(1, 30).unwrap();
        assert_eq!(initiator.bitcake.current(), 1000);
        cluster.network.release_link(0, 1);
        cluster.network.release_link(0, 2);
        let report = wait_report(&initiator).await;

        // Assert
        assert_eq!(report.balances, BTreeMap::from([(0, 1000), (1, 1000), (2, 1000)]));
        assert_eq!(report.total, 3000);

        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.servent(0).bitcake.current(), 970);
        assert_eq!(cluster.servent(1).bitcake.current(), 1030);
        assert_eq!(cluster.servent(2).bitcake.current(), 1000);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinated_checkpointing_counts_transfer_on_the_wire() {
        // Arrange: 1 pays 2, the transfer stays on the wire until both have frozen
        let cluster = Cluster::start(config(3, DeliveryMode::Causal, SnapshotKind::CoordinatedCheckpointing)).unwrap();
        cluster.network.hold_link(1, 0);
        cluster.network.hold_link(1, 2);
        cluster.servent(1).send_transaction(2, 50).unwrap();
        let payer = checkpointing(cluster.servent(1));
        let payee = checkpointing(cluster.servent(2));

        // Act
        cluster.servent(0).start_snapshot().unwrap();
        wait_until(|| payer.is_frozen() && payee.is_frozen()).await;
        cluster.network.release_link(1, 2);
        cluster.network.release_link(1, 0);
        let report = wait_report(cluster.servent(0)).await;

        // Assert
        assert_eq!(report.balances, BTreeMap::from([(0, 1000), (1, 950), (2, 1000)]));
        assert_eq!(report.in_transit, 50);
        assert_eq!(report.total, 3000);

        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.servent(2).bitcake.current(), 1050);
        assert_eq!(cluster.total_balance(), 3000);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coordinated_checkpointing_during_bursts_over_fifo_links() {
        // Arrange
        let cluster = Cluster::start(config(3, DeliveryMode::Fifo, SnapshotKind::CoordinatedCheckpointing)).unwrap();
        let bursts = burst_everywhere(&cluster).await;

        // Act
        cluster.servent(1).start_snapshot().unwrap();
        for burst in bursts {
            burst.await.unwrap();
        }
        let report = wait_report(cluster.servent(1)).await;

        // Assert
        assert_eq!(report.balances.len(), 3);
        assert_eq!(report.total, 3000);
        assert!(cluster.settle(Duration::from_secs(10)).await);
        assert_eq!(cluster.total_balance(), 3000);
        assert!(cluster.servents.iter().all(|servent| !checkpointing(servent).is_frozen()));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_snapshot_request_is_refused() {
        let cluster = Cluster::start(config(3, DeliveryMode::Causal, SnapshotKind::AcharyaBadrinath)).unwrap();

        cluster.servent(1).start_snapshot().unwrap();
        let second = cluster.servent(1).start_snapshot();
        let report = wait_report(cluster.servent(1)).await;

        assert_eq!(second, Err(crate::common::SnapshotError::AlreadyCollecting));
        assert_eq!(report.total, 3000);
        cluster.shutdown().await;
    }
}
