//! 资源协调模块
//!
//! 该模块实现单个 CdnCluster 的协调状态机：解析源依赖、写入 `status.state`、
//! 确保其拥有的 Deployment 存在且与期望规范一致，并发出用户可见的事件。
//!
//! 同一个键的协调由控制器保证串行执行，不同的键可以并行协调。

use cdn_common::{ClusterEvent, ClusterState, Error, ObjectKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{OperatorConfig, WorkloadConfig};
use crate::crd::{object_key, CdnCluster};
use crate::dependency::DependencyIndex;
use crate::metrics::OperatorMetrics;
use crate::recorder::EventRecorder;
use crate::status::StatusWriter;
use crate::store::ClusterStore;
use crate::workload::{build_deployment, deployment_name, needs_update, replacement_for};

/// 一次协调完成后的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// 已完成，等待下一次变更通知
    Done,
    /// 在给定间隔后重新协调
    Requeue(Duration),
}

/// 协调器结构体
pub struct Reconciler {
    /// 资源存储
    store: Arc<dyn ClusterStore>,
    /// 事件上报
    recorder: Arc<dyn EventRecorder>,
    /// 状态写入
    status: StatusWriter,
    /// 依赖索引
    index: DependencyIndex,
    /// 工作负载配置
    workload: WorkloadConfig,
    /// 等待源时的兜底间隔
    source_retry: Option<Duration>,
    /// 已收敛资源的周期性重新协调间隔
    resync: Option<Duration>,
    /// 指标
    metrics: Arc<OperatorMetrics>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        store: Arc<dyn ClusterStore>,
        recorder: Arc<dyn EventRecorder>,
        config: &OperatorConfig,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            status: StatusWriter::new(store.clone(), config.status_retries),
            index: DependencyIndex::new(store.clone()),
            store,
            recorder,
            workload: config.workload.clone(),
            source_retry: config.source_retry(),
            resync: config.resync(),
            metrics,
        }
    }

    /// 协调一个 CdnCluster
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        debug!(namespace = %key.namespace, name = %key.name, "协调 CdnCluster");

        // 资源已删除，其 Deployment 由垃圾回收器清理
        let Some(cluster) = self.store.get_cluster(key).await? else {
            debug!(%key, "CdnCluster 不存在，跳过");
            return Ok(ReconcileAction::Done);
        };

        if let Some(index) = cluster.spec.sources.iter().position(|s| s.name.is_empty()) {
            let event = ClusterEvent::invalid_spec(format!("sources[{}].name must not be empty", index));
            return self.reject(&cluster, event).await;
        }

        for source in &cluster.spec.sources {
            if self.store.get_cluster(&key.sibling(&source.name)).await?.is_none() {
                return self.wait_for_source(&cluster, &source.name).await;
            }
        }

        if !cluster.spec.sources.is_empty() {
            if let Some(path) = self.index.cycle_through(key).await? {
                return self.reject(&cluster, ClusterEvent::source_cycle(&path)).await;
            }
        }

        let Some(cluster) = self.status.write_state(&cluster, ClusterState::Deploying).await? else {
            return Ok(ReconcileAction::Done);
        };
        match self.ensure_deployment(&cluster).await {
            Ok(()) => {}
            // 规范本身无法被接受，重试不会改变结果
            Err(e @ (Error::Invalid(_) | Error::Json(_) | Error::Serialization(_))) => {
                let deployment = deployment_name(&cluster.name_any());
                warn!(%key, error = %e, "Deployment 被拒绝，等待规范变更");
                self.recorder
                    .publish(&cluster, &ClusterEvent::deployment_failed(&deployment, &e))
                    .await;
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(e),
        }

        Ok(self.resync.map_or(ReconcileAction::Done, ReconcileAction::Requeue))
    }

    /// 源未找到：进入 WaitingSource，等待源被创建时由事件映射重新触发
    async fn wait_for_source(&self, cluster: &CdnCluster, source: &str) -> Result<ReconcileAction> {
        info!(key = %cluster.key(), source, state = "WaitingSource", "源尚未就绪");

        if self.status.write_state(cluster, ClusterState::WaitingSource).await?.is_none() {
            return Ok(ReconcileAction::Done);
        }
        self.recorder
            .publish(cluster, &ClusterEvent::source_not_found(source))
            .await;

        Ok(self.source_retry.map_or(ReconcileAction::Done, ReconcileAction::Requeue))
    }

    /// 无法修复的规范：进入 WaitingSource 并发出警告，规范变更前不再重试
    async fn reject(&self, cluster: &CdnCluster, event: ClusterEvent) -> Result<ReconcileAction> {
        warn!(key = %cluster.key(), reason = %event.reason, "{}", event.message);

        if self.status.write_state(cluster, ClusterState::WaitingSource).await?.is_some() {
            self.recorder.publish(cluster, &event).await;
        }
        Ok(ReconcileAction::Done)
    }

    /// 确保 Deployment 存在且与期望规范一致
    async fn ensure_deployment(&self, cluster: &CdnCluster) -> Result<()> {
        let desired = build_deployment(cluster, &self.workload)?;
        let key = object_key(&desired);

        match self.store.get_deployment(&key).await? {
            None => {
                self.store.create_deployment(&desired).await?;
                info!(%key, "已创建 Deployment");
                self.metrics.observe_deployment_created();
                self.recorder
                    .publish(cluster, &ClusterEvent::deployment_created(&key.name))
                    .await;
            }
            Some(existing) if !is_controlled_by(&existing, cluster) => {
                let event = ClusterEvent::invalid_spec(format!(
                    "Deployment {} exists and is not controlled by this CdnCluster",
                    key.name
                ));
                warn!(%key, "Deployment 不属于该 CdnCluster，不做修改");
                self.recorder.publish(cluster, &event).await;
            }
            Some(existing) if needs_update(&existing, &desired) => {
                self.store
                    .replace_deployment(&replacement_for(&existing, &desired))
                    .await?;
                info!(%key, "已更新偏离期望的 Deployment");
                self.recorder
                    .publish(cluster, &ClusterEvent::deployment_updated(&key.name))
                    .await;
            }
            Some(_) => debug!(%key, "Deployment 已收敛"),
        }

        Ok(())
    }
}

/// Deployment 是否以控制者身份归属于该 CdnCluster
fn is_controlled_by(deployment: &Deployment, cluster: &CdnCluster) -> bool {
    let Some(uid) = cluster.uid() else {
        return false;
    };
    deployment
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}
