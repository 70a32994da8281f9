//! 异步运行时
//!
//! 每个成员一个心跳任务,按心跳间隔执行心跳、选举与同步源维护;每条新
//! 打开的链路一个应用任务,在源 oplog 追加时被唤醒。关闭链路只结束该链路
//! 的应用任务。

use crate::config::MemberId;
use crate::error::{ClusterError, ClusterResult};
use crate::link::LinkHandle;
use crate::oplog::Operation;
use crate::replset::ReplicaSet;
use crate::write_concern::{WriteAck, WriteConcern};
use mikudb_common::Namespace;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 副本集异步运行时
pub struct ReplSetRuntime {
    set: Arc<ReplicaSet>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplSetRuntime {
    pub fn new(set: Arc<ReplicaSet>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            set,
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self) -> &Arc<ReplicaSet> {
        &self.set
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 为每个成员启动心跳任务
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Starting replica set runtime with {} members",
            self.set.member_ids().len()
        );
        for id in self.set.member_ids() {
            self.spawn_member(id);
        }
    }

    /// 为一个成员(包括重新配置后新增的成员)启动心跳任务
    pub fn spawn_member(self: &Arc<Self>, id: MemberId) {
        let runtime = self.clone();
        let handle = tokio::spawn(async move { runtime.member_loop(id).await });
        self.tasks.lock().push(handle);
    }

    async fn member_loop(self: Arc<Self>, id: MemberId) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.set.election_config().heartbeat_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.set.heartbeat_node(id) {
                if matches!(e, ClusterError::NodeNotFound(_)) {
                    debug!("Member {} left the set, stopping its loop", id);
                    break;
                }
                warn!("Heartbeat round for {} failed: {}", id, e);
            }
            match self.set.maintain_sync(id) {
                Ok(Some(link)) => self.spawn_link(link),
                Ok(None) => {}
                Err(e) => warn!("Sync maintenance for {} failed: {}", id, e),
            }
        }
    }

    fn spawn_link(self: &Arc<Self>, link: Arc<LinkHandle>) {
        let set = self.set.clone();
        let handle = tokio::spawn(async move {
            let (Ok(source), Ok(destination)) =
                (set.node(link.source()), set.node(link.destination()))
            else {
                link.close();
                return;
            };
            let result = link
                .clone()
                .run(source, destination, set.network().clone(), set.link_settings())
                .await;
            if let Err(e) = result {
                set.on_link_error(&link, &e);
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 写入主节点并等待写确认
    pub async fn submit(
        &self,
        ns: Namespace,
        op: Operation,
        concern: &WriteConcern,
    ) -> ClusterResult<WriteAck> {
        let entry = self.set.submit(ns, op)?;
        let required = self.set.required_acks(entry.optime, concern)?;
        let poll = self.poll_interval();

        let wait = async {
            loop {
                let acked = self.set.acknowledgements(&entry);
                if acked >= required {
                    return acked;
                }
                tokio::time::sleep(poll).await;
            }
        };
        match tokio::time::timeout(concern.timeout(), wait).await {
            Ok(acked) => Ok(WriteAck {
                optime: entry.optime,
                acknowledged_by: acked,
            }),
            Err(_) => {
                let acked = self.set.acknowledgements(&entry);
                warn!(
                    "Write concern timed out at {}: {} of {} acknowledged",
                    entry.optime, acked, required
                );
                Err(ClusterError::WriteConcernFailed {
                    optime: entry.optime,
                    reason: format!("{} of {} members acknowledged", acked, required),
                    wtimeout: true,
                })
            }
        }
    }

    /// 轮询直到条件成立,超过 `patience` 返回 `Timeout`
    pub async fn wait_until<F>(&self, mut cond: F, patience: Duration) -> ClusterResult<()>
    where
        F: FnMut(&ReplicaSet) -> bool,
    {
        let poll = self.poll_interval();
        let wait = async {
            while !cond(&self.set) {
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(patience, wait)
            .await
            .map_err(|_| ClusterError::Timeout(format!("condition not reached within {:?}", patience)))
    }

    /// 等待复制完成
    pub async fn await_replication(&self, patience: Duration) -> ClusterResult<()> {
        self.wait_until(|set| set.replication_complete(), patience).await
    }

    fn poll_interval(&self) -> Duration {
        (self.set.election_config().heartbeat_interval() / 2).max(Duration::from_millis(1))
    }

    /// 停止所有任务
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down replica set runtime...");
        self.shutdown_tx.send_replace(true);
        self.set.close_links();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Runtime task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, MemberConfig, ReplicaSetConfig};
    use mikudb_common::ObjectId;
    use serde_json::json;

    fn fast_set() -> Arc<ReplicaSet> {
        let rs = ReplicaSetConfig::new(
            "rs",
            vec![
                MemberConfig::new(0).priority(2),
                MemberConfig::new(1),
                MemberConfig::new(2).priority(0).filtered(["included"]),
            ],
        );
        let mut config = ClusterConfig::new(rs);
        config.election.heartbeat_interval_ms = 5;
        Arc::new(ReplicaSet::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_runtime_elects_and_replicates() {
        let runtime = ReplSetRuntime::new(fast_set());
        runtime.start();
        runtime
            .wait_until(|s| s.primary().is_some(), Duration::from_secs(5))
            .await
            .unwrap();

        let included = Namespace::parse("included.docs").unwrap();
        let excluded = Namespace::parse("excluded.docs").unwrap();
        let concern = WriteConcern::nodes(3).with_timeout(Duration::from_secs(5));
        for ns in [&included, &excluded] {
            let ack = runtime
                .submit(ns.clone(), Operation::Insert { id: ObjectId::new(), doc: json!({}) }, &concern)
                .await
                .unwrap();
            assert_eq!(ack.acknowledged_by, 3);
        }

        let set = runtime.set();
        assert_eq!(set.count(MemberId(2), &included).unwrap(), 1);
        assert_eq!(set.count(MemberId(2), &excluded).unwrap(), 0);
        assert!(set.all_oplogs_match().unwrap());

        runtime.shutdown().await;
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_runtime_write_concern_timeout() {
        let runtime = ReplSetRuntime::new(fast_set());
        runtime.start();
        runtime
            .wait_until(|s| s.primary().is_some(), Duration::from_secs(5))
            .await
            .unwrap();
        runtime.await_replication(Duration::from_secs(5)).await.unwrap();

        let primary = runtime.set().primary().unwrap();
        for id in runtime.set().member_ids() {
            runtime.set().network().disconnect(primary, id);
        }
        let concern = WriteConcern::nodes(2).with_timeout(Duration::from_millis(50));
        let err = runtime
            .submit(
                Namespace::parse("included.docs").unwrap(),
                Operation::Insert { id: ObjectId::new(), doc: json!({}) },
                &concern,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::WriteConcernFailed { wtimeout: true, .. }));
        runtime.shutdown().await;
    }
}
