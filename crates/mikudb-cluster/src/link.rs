//! 复制链路
//!
//! 一条链路把源节点 oplog 的尾随游标接到目标节点的应用路径上。链路在
//! 网络不可达、源分叉或目标拒绝时关闭,关闭后不会自行恢复,由同步维护
//! 重新选源并打开新链路。

use crate::config::MemberId;
use crate::error::{ClusterError, ClusterResult};
use crate::network::Network;
use crate::node::{ReplNode, RollbackPhase};
use crate::oplog::{OpTime, OplogCursor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

/// 链路参数
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub batch_size: usize,
    /// 回滚追赶时允许落后源的条目数
    pub catchup_lag: usize,
    /// 异步应用循环在没有新条目时的最长等待
    pub idle_poll: Duration,
}

/// 一次泵送的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// 应用了若干条目
    Applied(usize),
    /// 源没有新条目
    Idle,
    /// 链路已关闭
    Closed,
}

/// 复制链路句柄
pub struct LinkHandle {
    source: MemberId,
    destination: MemberId,
    cursor: Mutex<OplogCursor>,
    closed: AtomicBool,
    close_notify: Notify,
    applied: AtomicU64,
}

impl LinkHandle {
    /// 打开链路,从目标的 `from` 位置开始尾随
    pub fn open(source: &ReplNode, destination: &ReplNode, from: OpTime) -> Arc<Self> {
        let anchor = destination.oplog().find(from).map(|e| e.fingerprint());
        let cursor = source.oplog().read_from(from, anchor);
        destination.set_sync_source(Some(source.id()));
        info!(
            "Opened replication link {} -> {} from {}",
            source.id(),
            destination.id(),
            from
        );
        Arc::new(Self {
            source: source.id(),
            destination: destination.id(),
            cursor: Mutex::new(cursor),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            applied: AtomicU64::new(0),
        })
    }

    pub fn source(&self) -> MemberId {
        self.source
    }

    pub fn destination(&self) -> MemberId {
        self.destination
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 已通过本链路应用的条目数
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn position(&self) -> OpTime {
        self.cursor.lock().position()
    }

    /// 关闭链路
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed replication link {} -> {}", self.source, self.destination);
            self.close_notify.notify_waiters();
        }
    }

    /// 拉取并应用一批条目
    pub fn pump(
        &self,
        destination: &ReplNode,
        network: &Network,
        settings: &LinkSettings,
    ) -> ClusterResult<PumpOutcome> {
        if self.is_closed() {
            return Ok(PumpOutcome::Closed);
        }
        if !network.can_reach(self.source, self.destination) {
            info!(
                "Replication link {} -> {} lost connectivity",
                self.source, self.destination
            );
            self.close();
            return Ok(PumpOutcome::Closed);
        }

        let mut cursor = self.cursor.lock();
        let batch = match cursor.next_batch(settings.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        let applied = if batch.is_empty() {
            0
        } else {
            match destination.apply_batch(self.source, &batch) {
                Ok(n) => n,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        };
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
        trace!(
            "Link {} -> {} applied {} entries, now at {}",
            self.source,
            self.destination,
            applied,
            cursor.position()
        );

        if let Some(RollbackPhase::CatchingUp { source }) = destination.rollback_phase() {
            if source == self.source && cursor.remaining() <= settings.catchup_lag {
                destination.finish_rollback();
            }
        }

        if batch.is_empty() {
            Ok(PumpOutcome::Idle)
        } else {
            Ok(PumpOutcome::Applied(applied))
        }
    }

    /// 一直泵送到源没有新条目为止
    pub fn drain(
        &self,
        destination: &ReplNode,
        network: &Network,
        settings: &LinkSettings,
    ) -> ClusterResult<PumpOutcome> {
        let mut total = 0;
        loop {
            match self.pump(destination, network, settings)? {
                PumpOutcome::Applied(n) => total += n,
                PumpOutcome::Idle if total > 0 => return Ok(PumpOutcome::Applied(total)),
                other => return Ok(other),
            }
        }
    }

    /// 异步应用循环
    ///
    /// 源 oplog 追加时被唤醒;链路关闭或出错时返回。
    pub async fn run(
        self: Arc<Self>,
        source: Arc<ReplNode>,
        destination: Arc<ReplNode>,
        network: Arc<Network>,
        settings: LinkSettings,
    ) -> ClusterResult<()> {
        let mut appended = source.oplog().subscribe();
        loop {
            match self.drain(&destination, &network, &settings)? {
                PumpOutcome::Closed => return Ok(()),
                PumpOutcome::Applied(_) => continue,
                PumpOutcome::Idle => {}
            }
            tokio::select! {
                changed = appended.changed() => {
                    if changed.is_err() {
                        self.close();
                        return Err(ClusterError::Internal(format!(
                            "oplog of {} dropped",
                            self.source
                        )));
                    }
                }
                _ = self.close_notify.notified() => {}
                _ = tokio::time::sleep(settings.idle_poll) => {}
            }
        }
    }
}
