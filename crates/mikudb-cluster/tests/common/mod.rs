//! 集成测试共用的副本集构造与数据检查

#![allow(dead_code)]

use mikudb_cluster::{
    ClusterConfig, MemberId, NodeRole, OplogEntry, Operation, ReplicaSet, WriteConcern,
};
use mikudb_common::{Namespace, ObjectId};
use serde_json::json;
use std::sync::Arc;

pub const A: MemberId = MemberId(0);
pub const B: MemberId = MemberId(1);
pub const C: MemberId = MemberId(2);
pub const D: MemberId = MemberId(3);
pub const E: MemberId = MemberId(4);

pub const EXCLUDED: [&str; 2] = ["excluded.excluded", "partial.excluded"];
pub const INCLUDED: [&str; 2] = ["included.included", "partial.included"];

/// 主、从、过滤节点与两个仲裁者
pub const FILTERED_SET: &str = r#"
[replica_set]
name = "filtered6"
members = [
    { id = 0, host = "node0", priority = 3 },
    { id = 1, host = "node1", priority = 2 },
    { id = 2, host = "node2", priority = 0, filter = ["admin", "included", "partial.included"] },
    { id = 3, host = "node3", priority = 0, arbiter_only = true },
    { id = 4, host = "node4", priority = 0, arbiter_only = true },
]

[election]
heartbeat_interval_ms = 10
election_timeout_heartbeats = 3

[replication]
batch_size = 3
"#;

pub const ROUNDS: usize = 200;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn filtered_set() -> ReplicaSet {
    init_tracing();
    ReplicaSet::new(ClusterConfig::from_toml_str(FILTERED_SET).unwrap()).unwrap()
}

pub fn ns(s: &str) -> Namespace {
    Namespace::parse(s).unwrap()
}

pub fn both_namespaces() -> Vec<&'static str> {
    EXCLUDED.iter().chain(INCLUDED.iter()).copied().collect()
}

/// 在当前主节点上向每个命名空间写入一份 `{ns, n}`
pub fn write_copy(set: &ReplicaSet, n: i64) -> Vec<Arc<OplogEntry>> {
    both_namespaces()
        .into_iter()
        .map(|s| {
            let op = Operation::Insert {
                id: ObjectId::new(),
                doc: json!({ "ns": s, "n": n }),
            };
            let ack = set.write(ns(s), op, &WriteConcern::nodes(1)).unwrap();
            set.node(set.primary().unwrap())
                .unwrap()
                .oplog()
                .find(ack.optime)
                .unwrap()
        })
        .collect()
}

/// 成员在命名空间中第 `n` 份写入的文档数
pub fn copies(set: &ReplicaSet, id: MemberId, s: &str, n: i64) -> usize {
    set.node(id)
        .unwrap()
        .storage()
        .documents(&ns(s))
        .into_iter()
        .filter(|(_, doc)| doc["n"] == json!(n) && doc["ns"] == json!(s))
        .count()
}

pub fn role(set: &ReplicaSet, id: MemberId) -> NodeRole {
    set.node(id).unwrap().role()
}

/// 推进直到成员经过 Rollback 回到 Secondary
pub fn wait_rollback_complete(set: &ReplicaSet, id: MemberId) {
    let mut saw_rollback = false;
    set.run_until(
        |s| {
            let r = role(s, id);
            saw_rollback |= r == NodeRole::Rollback;
            saw_rollback && r == NodeRole::Secondary
        },
        ROUNDS,
    )
    .unwrap();
}

/// 完整节点拥有全部命名空间中 `present` 的写入,没有 `absent` 的写入
pub fn check_full(set: &ReplicaSet, id: MemberId, present: &[i64], absent: &[i64]) {
    for s in both_namespaces() {
        for n in present {
            assert_eq!(copies(set, id, s, *n), 1, "member {} {} copy {}", id, s, n);
        }
        for n in absent {
            assert_eq!(copies(set, id, s, *n), 0, "member {} {} copy {}", id, s, n);
        }
        assert_eq!(set.count(id, &ns(s)).unwrap(), present.len());
    }
}

/// 过滤节点只拥有被允许的命名空间
pub fn check_filtered(set: &ReplicaSet, id: MemberId, present: &[i64], absent: &[i64]) {
    for s in EXCLUDED {
        assert_eq!(set.count(id, &ns(s)).unwrap(), 0, "member {} holds {}", id, s);
    }
    for s in INCLUDED {
        for n in present {
            assert_eq!(copies(set, id, s, *n), 1, "member {} {} copy {}", id, s, n);
        }
        for n in absent {
            assert_eq!(copies(set, id, s, *n), 0, "member {} {} copy {}", id, s, n);
        }
        assert_eq!(set.count(id, &ns(s)).unwrap(), present.len());
    }
}

/// 建立分叉:A 写入 W1 后被隔离,B 当选并写入 W2(只到达 C),
/// 然后 BC 与 ADE 分区,A 重新当选并写入 W3。返回 W2 的任期。
pub fn diverge(set: &ReplicaSet) -> u64 {
    set.run_until(|s| s.primary() == Some(A), ROUNDS).unwrap();
    write_copy(set, 0);
    set.await_replication(ROUNDS).unwrap();

    set.isolate(A);
    set.run_until(|s| role(s, B) == NodeRole::Primary, ROUNDS).unwrap();
    let w2_term = set.node(B).unwrap().term();
    write_copy(set, 1);
    set.run_until(
        |s| s.node(C).unwrap().last_applied() == s.node(B).unwrap().last_applied(),
        ROUNDS,
    )
    .unwrap();

    set.partition(&[&[B, C], &[A, D, E]]);
    set.run_until(|s| role(s, B) == NodeRole::Secondary, ROUNDS).unwrap();
    set.run_until(|s| role(s, A) == NodeRole::Primary, ROUNDS).unwrap();
    write_copy(set, 2);
    w2_term
}
