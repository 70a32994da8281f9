//! MikuDB 副本集进程
//!
//! 加载副本集配置,在进程内启动全部成员,写入演示数据并输出副本集状态。

use mikudb_cluster::{
    ClusterConfig, ClusterResult, Operation, ReplSetRuntime, ReplSetStatus, ReplicaSet,
};
use mikudb_common::{Namespace, ObjectId};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 内置的副本集配置
pub const DEFAULT_CONFIG: &str = include_str!("../config/replset.toml");

/// 演示写入的命名空间:过滤成员只复制前者
pub const DEMO_NAMESPACES: [&str; 2] = ["app.orders", "logs.events"];

pub fn print_banner() {
    println!(
        r#"
  __  __ _ _          ____  ____
 |  \/  (_) | ___   _|  _ \| __ )
 | |\/| | | |/ / | | | | | |  _ \
 | |  | | |   <| |_| | |_| | |_) |
 |_|  |_|_|_|\_\\__,_|____/|____/

 MikuDB replica set v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true))
        .with(filter)
        .init();
}

/// 从文件加载配置,未指定时使用内置配置
pub fn load_config(path: Option<&Path>) -> ClusterResult<ClusterConfig> {
    match path {
        Some(path) => {
            info!("Loading replica set config from {:?}", path);
            ClusterConfig::load(path)
        }
        None => ClusterConfig::from_toml_str(DEFAULT_CONFIG),
    }
}

/// 启动运行时,等待选出主节点后按默认写确认写入 `writes` 轮演示数据
pub async fn run_demo(
    config: ClusterConfig,
    writes: usize,
    patience: Duration,
) -> ClusterResult<(Arc<ReplSetRuntime>, ReplSetStatus)> {
    let set = Arc::new(ReplicaSet::new(config)?);
    let concern = set.replication_config().write_concern;
    let runtime = ReplSetRuntime::new(set);
    runtime.start();

    runtime
        .wait_until(|s| s.primary().is_some(), patience)
        .await?;
    info!("Primary elected: {:?}", runtime.set().primary());

    let namespaces = DEMO_NAMESPACES
        .iter()
        .map(|s| Namespace::parse(s))
        .collect::<Result<Vec<_>, _>>()?;
    for n in 0..writes {
        for ns in &namespaces {
            let op = Operation::Insert {
                id: ObjectId::new(),
                doc: json!({ "ns": ns.to_string(), "n": n }),
            };
            let ack = runtime.submit(ns.clone(), op, &concern).await?;
            info!("Write {} to {} acknowledged by {}", ack.optime, ns, ack.acknowledged_by);
        }
    }

    runtime.await_replication(patience).await?;
    let status = runtime.set().status();
    Ok((runtime, status))
}
