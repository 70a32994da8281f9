//! 成员配置服务
//!
//! 副本集配置以带版本的不可变快照形式发布。节点只读取快照,不直接修改
//! 其他节点的状态;重新配置必须提交一个更高的版本。

use crate::config::ReplicaSetConfig;
use crate::error::{ClusterError, ClusterResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// 成员配置服务接口
pub trait MembershipService: Send + Sync {
    /// 当前配置快照
    fn current_config(&self) -> Arc<ReplicaSetConfig>;

    /// 提交新配置,版本必须严格大于当前版本
    fn propose_reconfig(&self, config: ReplicaSetConfig) -> ClusterResult<()>;
}

/// 进程内配置服务
pub struct InMemoryMembership {
    current: RwLock<Arc<ReplicaSetConfig>>,
}

impl InMemoryMembership {
    pub fn new(config: ReplicaSetConfig) -> ClusterResult<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
        })
    }
}

impl MembershipService for InMemoryMembership {
    fn current_config(&self) -> Arc<ReplicaSetConfig> {
        self.current.read().clone()
    }

    fn propose_reconfig(&self, config: ReplicaSetConfig) -> ClusterResult<()> {
        config.validate()?;
        let mut current = self.current.write();
        if config.version <= current.version {
            return Err(ClusterError::VersionConflict {
                current: current.version,
                proposed: config.version,
            });
        }
        if config.name != current.name {
            return Err(ClusterError::Config(format!(
                "Replica set name mismatch: {} vs {}",
                config.name, current.name
            )));
        }
        info!(
            "Replica set {} reconfigured: version {} -> {}",
            config.name, current.version, config.version
        );
        *current = Arc::new(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberConfig;

    #[test]
    fn test_reconfig_requires_higher_version() {
        let base = ReplicaSetConfig::new("rs", vec![MemberConfig::new(0), MemberConfig::new(1)]);
        let svc = InMemoryMembership::new(base.clone()).unwrap();

        let mut stale = base.clone();
        stale.members.push(MemberConfig::new(2));
        assert_eq!(
            svc.propose_reconfig(stale.clone()),
            Err(ClusterError::VersionConflict { current: 1, proposed: 1 })
        );

        stale.version = 2;
        svc.propose_reconfig(stale).unwrap();
        let current = svc.current_config();
        assert_eq!(current.version, 2);
        assert_eq!(current.members.len(), 3);
    }

    #[test]
    fn test_reconfig_validates() {
        let base = ReplicaSetConfig::new("rs", vec![MemberConfig::new(0)]);
        let svc = InMemoryMembership::new(base.clone()).unwrap();
        let mut bad = base;
        bad.version = 2;
        bad.members.push(MemberConfig::new(0));
        assert!(matches!(svc.propose_reconfig(bad), Err(ClusterError::Config(_))));
    }
}
