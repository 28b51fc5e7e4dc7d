use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{error, info};

use super::strategy::{SnapshotReport, SnapshotStrategy};
use crate::common::{NodeId, SnapshotError};

/*
    Idle -> Collecting -> Idle. A start request flips the collector into
    Collecting and wakes the run loop, which initiates the snapshot, waits for
    the strategy to report completion, turns the collected state into a report
    and goes back to Idle. Only one snapshot runs at a time; a start request
    while Collecting is refused.
*/

pub struct SnapshotCollector {
    me: NodeId,
    strategy: Arc<dyn SnapshotStrategy>,
    collecting: AtomicBool,
    working: AtomicBool,
    start: Notify,
    poll_interval: Duration,
    reports: watch::Sender<Option<SnapshotReport>>,
}

impl SnapshotCollector {
    pub fn new(me: NodeId, strategy: Arc<dyn SnapshotStrategy>, poll_interval: Duration) -> Self {
        let (reports, _) = watch::channel(None);
        SnapshotCollector {
            me,
            strategy,
            collecting: AtomicBool::new(false),
            working: AtomicBool::new(true),
            start: Notify::new(),
            poll_interval,
            reports,
        }
    }

    pub fn start_collecting(&self) -> Result<(), SnapshotError> {
        if !self.working.load(Ordering::SeqCst) {
            return Err(SnapshotError::Stopped);
        }

        if self
            .collecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!(node = self.me, "tried to start collecting before finished with previous");
            return Err(SnapshotError::AlreadyCollecting);
        }

        self.start.notify_one();
        Ok(())
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SnapshotReport>> {
        self.reports.subscribe()
    }

    pub fn last_report(&self) -> Option<SnapshotReport> {
        self.reports.borrow().clone()
    }

    pub fn stop(&self) {
        self.working.store(false, Ordering::SeqCst);
        self.start.notify_one();
        self.strategy.progress().notify_one();
    }

    fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub async fn run(self: Arc<Self>) {
        info!(node = self.me, kind = ?self.strategy.kind(), "snapshot collector running");

        while self.is_working() {
            if !self.is_collecting() {
                let _ = timeout(self.poll_interval, self.start.notified()).await;
                continue;
            }

            if let Err(err) = self.strategy.initiate_snapshot() {
                error!(node = self.me, %err, "couldn't initiate snapshot");
                self.collecting.store(false, Ordering::SeqCst);
                continue;
            }

            while self.is_working() && !self.strategy.is_snapshot_complete() {
                let _ = timeout(self.poll_interval, self.strategy.progress().notified()).await;
            }
            if !self.is_working() {
                break;
            }

            match self.strategy.process_collected_data().await {
                Ok(report) => {
                    info!(
                        node = self.me,
                        kind = ?report.kind,
                        total = report.total,
                        in_transit = report.in_transit,
                        "snapshot finished"
                    );
                    self.reports.send_replace(Some(report));
                }
                Err(err) => error!(node = self.me, %err, "couldn't process collected data"),
            }

            self.strategy.clear();
            self.collecting.store(false, Ordering::SeqCst);
        }

        info!(node = self.me, "snapshot collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::common::{ServentError, SnapshotKind};

    /// Completes once `needed` pieces were collected.
    struct Counting {
        collected: AtomicUsize,
        needed: usize,
        initiated: AtomicUsize,
        cleared: AtomicUsize,
        progress: Notify,
    }

    impl Counting {
        fn new(needed: usize) -> Self {
            Counting {
                collected: AtomicUsize::new(0),
                needed,
                initiated: AtomicUsize::new(0),
                cleared: AtomicUsize::new(0),
                progress: Notify::new(),
            }
        }

        fn collect_one(&self) {
            self.collected.fetch_add(1, Ordering::SeqCst);
            self.progress.notify_one();
        }
    }

    #[async_trait]
    impl SnapshotStrategy for Counting {
        fn kind(&self) -> SnapshotKind {
            SnapshotKind::AcharyaBadrinath
        }

        fn initiate_snapshot(&self) -> Result<(), ServentError> {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_snapshot_complete(&self) -> bool {
            self.collected.load(Ordering::SeqCst) >= self.needed
        }

        fn progress(&self) -> &Notify {
            &self.progress
        }

        async fn process_collected_data(&self) -> Result<SnapshotReport, ServentError> {
            let count = self.collected.load(Ordering::SeqCst) as i64;
            Ok(SnapshotReport {
                kind: SnapshotKind::AcharyaBadrinath,
                initiator: 0,
                balances: BTreeMap::from([(0, count)]),
                in_transit: 0,
                total: count,
            })
        }

        fn clear(&self) {
            self.collected.store(0, Ordering::SeqCst);
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_collects_one_snapshot_at_a_time() {
        // Arrange
        let strategy = Arc::new(Counting::new(2));
        let collector = Arc::new(SnapshotCollector::new(0, strategy.clone(), Duration::from_secs(5)));
        let mut reports = collector.subscribe();
        let task = tokio::spawn(collector.clone().run());

        // Act
        collector.start_collecting().unwrap();
        let second = collector.start_collecting();
        strategy.collect_one();
        strategy.collect_one();
        let report = timeout(Duration::from_secs(2), reports.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();

        // Assert
        assert_eq!(second, Err(SnapshotError::AlreadyCollecting));
        assert_eq!(report.map(|r| r.total), Some(2));
        assert_eq!(strategy.initiated.load(Ordering::SeqCst), 1);

        collector.stop();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(strategy.cleared.load(Ordering::SeqCst), 1);
        assert!(!collector.is_collecting());
        assert_eq!(collector.start_collecting(), Err(SnapshotError::Stopped));
    }

    #[tokio::test]
    async fn test_stop_interrupts_unfinished_snapshot() {
        // Arrange
        let strategy = Arc::new(Counting::new(3));
        let collector = Arc::new(SnapshotCollector::new(0, strategy.clone(), Duration::from_secs(5)));
        let task = tokio::spawn(collector.clone().run());
        collector.start_collecting().unwrap();
        strategy.collect_one();

        // Act
        collector.stop();

        // Assert
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(collector.last_report().is_none());
    }
}
