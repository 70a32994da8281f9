use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mikudb-replset")]
#[command(author = "MikuDB Team")]
#[command(version)]
#[command(about = "MikuDB replica set - elections, filtered replication and rollback")]
struct Args {
    #[arg(short, long, env = "MIKUDB_REPLSET_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// 每个演示命名空间的写入数
    #[arg(short, long, default_value_t = 10)]
    writes: usize,

    /// 等待选举与复制的心跳轮数
    #[arg(short, long, default_value_t = 200)]
    rounds: u32,

    /// 输出状态后继续运行直到收到 Ctrl-C
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    mikudb_replset::init_logging(&args.log_level);

    mikudb_replset::print_banner();

    let config = mikudb_replset::load_config(args.config.as_deref())?;
    let patience = Duration::from_millis(config.election.heartbeat_interval_ms) * args.rounds;
    info!(
        "Starting replica set {} with {} members",
        config.replica_set.name,
        config.replica_set.members.len()
    );

    let (runtime, status) = match mikudb_replset::run_demo(config, args.writes, patience).await {
        Ok(result) => result,
        Err(e) => {
            error!("Replica set demo failed: {}", e);
            return Err(anyhow::anyhow!("{}", e));
        }
    };
    println!("{}", serde_json::to_string_pretty(&status)?);

    if args.serve {
        info!("Replica set running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    runtime.shutdown().await;
    info!("MikuDB replica set stopped");
    Ok(())
}
