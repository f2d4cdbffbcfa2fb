//! CDN Operator 入口

use anyhow::{Context, Result};
use cdn_operator::config::OperatorConfig;
use cdn_operator::crd::CdnCluster;
use cdn_operator::CdnOperator;
use clap::Parser;
use kube::CustomResourceExt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "cdn-operator", version, about = "Kubernetes Operator for CdnCluster resources")]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 未设置 RUST_LOG 时使用的日志级别
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 输出 CdnCluster CRD 清单后退出
    #[arg(long)]
    generate_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_crd {
        print!("{}", serde_yaml::to_string(&CdnCluster::crd())?);
        return Ok(());
    }

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("无效的日志级别")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = OperatorConfig::load(args.config.as_deref()).context("加载配置失败")?;
    info!(?config, "配置已加载");

    let operator = CdnOperator::connect(config).await?;
    operator.start().await?;

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");

    operator.stop().await
}
