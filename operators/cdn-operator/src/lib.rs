//! CDN Operator - 管理 CdnCluster 资源的 Kubernetes Operator
//!
//! 该模块实现了 CdnCluster 的协调引擎：解析集群之间按名称声明的源依赖，
//! 在依赖满足后创建并维护其拥有的 Deployment，并通过 `status.state` 与事件
//! 反映每次协调的结论。

pub mod config;
pub mod controller;
pub mod crd;
pub mod dependency;
pub mod event_handler;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod metrics;
pub mod reconcile;
pub mod recorder;
pub mod status;
pub mod store;
pub mod utils;
pub mod workload;

use anyhow::{Context, Result};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::OperatorConfig;
use crate::metrics::OperatorMetrics;
use crate::recorder::KubeEventRecorder;
use crate::store::KubeStore;

/// Operator 主结构体
pub struct CdnOperator {
    /// 配置
    config: OperatorConfig,
    /// 指标
    metrics: Arc<OperatorMetrics>,
    /// 控制器
    controller: Arc<RwLock<controller::Controller>>,
    /// 指标服务器任务
    metrics_server: Mutex<Option<JoinHandle<()>>>,
}

impl CdnOperator {
    /// 使用给定的 Kubernetes 客户端创建 Operator 实例
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(OperatorMetrics::new()?);
        let store = Arc::new(KubeStore::new(client.clone()));
        let recorder = Arc::new(KubeEventRecorder::new(client.clone(), &config.controller_name));
        let controller = Arc::new(RwLock::new(controller::Controller::new(
            client,
            store,
            recorder,
            &config,
            metrics.clone(),
        )));

        Ok(Self {
            config,
            metrics,
            controller,
            metrics_server: Mutex::new(None),
        })
    }

    /// 连接当前上下文中的 Kubernetes 集群并创建 Operator 实例
    pub async fn connect(config: OperatorConfig) -> Result<Self> {
        // 创建 Kubernetes 客户端
        let client = Client::try_default()
            .await
            .context("创建 Kubernetes 客户端失败")?;

        Self::new(client, config)
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        if self.config.metrics.enabled {
            let addr: SocketAddr = format!(
                "{}:{}",
                self.config.metrics.listen_address, self.config.metrics.port
            )
            .parse()
            .context("无效的指标监听地址")?;
            let handle = self.metrics.spawn_server(addr)?;
            *self.metrics_server.lock().await = Some(handle);
        }

        // 启动控制器
        self.controller.write().await.start().await?;

        info!("CDN Operator 已启动");
        Ok(())
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        // 停止控制器
        self.controller.write().await.stop().await?;

        if let Some(handle) = self.metrics_server.lock().await.take() {
            handle.abort();
        }

        info!("CDN Operator 已停止");
        Ok(())
    }

    /// 获取指标
    pub fn metrics(&self) -> Arc<OperatorMetrics> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 指向不可达地址的客户端，只用于构造，不发出请求
    fn offline_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = OperatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(CdnOperator::new(offline_client(), config).is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut config = OperatorConfig::default();
        config.metrics.enabled = false;

        let operator = CdnOperator::new(offline_client(), config).unwrap();
        operator.stop().await.unwrap();
        assert!(operator
            .metrics()
            .render()
            .unwrap()
            .contains("cdn_operator_deployments_created_total 0"));
    }
}
