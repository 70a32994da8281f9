//! 成员间可达性
//!
//! 网络分区用被切断的成员对表示。连接是对称的;断开与恢复都是显式的
//! 外部动作,引擎内部不会自动重连。

use crate::config::MemberId;
use dashmap::DashSet;
use tracing::info;

/// 可达性图
#[derive(Debug, Default)]
pub struct Network {
    severed: DashSet<(MemberId, MemberId)>,
}

fn key(a: MemberId, b: MemberId) -> (MemberId, MemberId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切断两个成员之间的连接
    pub fn disconnect(&self, a: MemberId, b: MemberId) {
        if a != b && self.severed.insert(key(a, b)) {
            info!("Network: disconnected {} <-> {}", a, b);
        }
    }

    /// 恢复两个成员之间的连接
    pub fn reconnect(&self, a: MemberId, b: MemberId) {
        if self.severed.remove(&key(a, b)).is_some() {
            info!("Network: reconnected {} <-> {}", a, b);
        }
    }

    /// 把 `member` 与 `others` 全部隔离
    pub fn isolate(&self, member: MemberId, others: impl IntoIterator<Item = MemberId>) {
        for other in others {
            self.disconnect(member, other);
        }
    }

    /// 按分组重新划分网络:组内互通,组间不通
    pub fn partition(&self, groups: &[&[MemberId]]) {
        self.heal();
        for (i, left) in groups.iter().enumerate() {
            for right in &groups[i + 1..] {
                for a in left.iter() {
                    for b in right.iter() {
                        self.disconnect(*a, *b);
                    }
                }
            }
        }
    }

    /// 恢复所有连接
    pub fn heal(&self) {
        if !self.severed.is_empty() {
            info!("Network: healing {} severed links", self.severed.len());
        }
        self.severed.clear();
    }

    pub fn can_reach(&self, a: MemberId, b: MemberId) -> bool {
        a == b || !self.severed.contains(&key(a, b))
    }
}
