//! 内存存储模块
//!
//! `MemoryStore` 在进程内模拟 API Server 的语义：单调递增的 resourceVersion、
//! 版本冲突检测、无变化的写入不改变版本，以及基于 ownerReferences 的级联删除。
//! 只用于测试，不依赖真实集群。

use async_trait::async_trait;
use cdn_common::{Error, ObjectKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::crd::{object_key, CdnCluster, CdnClusterSpec};
use crate::store::ClusterStore;

/// 内存中的对象集合
#[derive(Default)]
struct MemoryState {
    /// CdnCluster 对象
    clusters: BTreeMap<ObjectKey, CdnCluster>,
    /// Deployment 对象
    deployments: BTreeMap<ObjectKey, Deployment>,
    /// 最近分配的 resourceVersion
    version: u64,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// 内存存储
pub struct MemoryStore {
    /// 对象集合
    state: RwLock<MemoryState>,
    /// 删除 CdnCluster 时是否级联删除其拥有的 Deployment
    garbage_collection: bool,
    /// 为 false 时所有调用返回暂时性错误
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// 创建启用级联删除的内存存储
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            garbage_collection: true,
            available: AtomicBool::new(true),
        }
    }

    /// 关闭级联删除，行为与未运行垃圾回收器的控制平面一致
    pub fn without_garbage_collection(mut self) -> Self {
        self.garbage_collection = false;
        self
    }

    /// 切换存储可用性
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transient("存储不可用".into()))
        }
    }

    /// 创建 CdnCluster，分配 uid 与 resourceVersion
    pub async fn create_cluster(&self, mut cluster: CdnCluster) -> Result<CdnCluster> {
        self.ensure_available()?;
        if cluster.metadata.namespace.is_none() {
            cluster.metadata.namespace = Some("default".into());
        }
        let key = cluster.key();

        let mut state = self.state.write().await;
        if state.clusters.contains_key(&key) {
            return Err(Error::Conflict(format!("CdnCluster {} 已存在", key)));
        }
        cluster.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        cluster.metadata.generation = Some(1);
        cluster.metadata.resource_version = Some(state.next_version());
        state.clusters.insert(key.clone(), cluster.clone());

        debug!(%key, "内存存储创建 CdnCluster");
        Ok(cluster)
    }

    /// 修改 CdnCluster 的规范
    pub async fn update_cluster_spec(
        &self,
        key: &ObjectKey,
        spec: CdnClusterSpec,
    ) -> Result<CdnCluster> {
        self.modify_cluster(key, |cluster| {
            cluster.spec = spec;
            cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
        })
        .await
    }

    /// 修改 CdnCluster 的标签，模拟与协调器并发的外部写入
    pub async fn update_cluster_labels(
        &self,
        key: &ObjectKey,
        labels: BTreeMap<String, String>,
    ) -> Result<CdnCluster> {
        self.modify_cluster(key, |cluster| {
            cluster.metadata.labels = Some(labels);
        })
        .await
    }

    async fn modify_cluster<F>(&self, key: &ObjectKey, apply: F) -> Result<CdnCluster>
    where
        F: FnOnce(&mut CdnCluster),
    {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let version = state.next_version();
        let cluster = state
            .clusters
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("CdnCluster {}", key)))?;
        apply(cluster);
        cluster.metadata.resource_version = Some(version);
        Ok(cluster.clone())
    }

    /// 删除 CdnCluster，启用级联删除时一并删除其拥有的 Deployment
    pub async fn delete_cluster(&self, key: &ObjectKey) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let cluster = state
            .clusters
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("CdnCluster {}", key)))?;

        if self.garbage_collection {
            let uid = cluster.uid();
            state.deployments.retain(|owned_key, deployment| {
                let owned = deployment
                    .owner_references()
                    .iter()
                    .any(|owner| Some(&owner.uid) == uid.as_ref());
                if owned {
                    debug!(key = %owned_key, "级联删除 Deployment");
                }
                !owned
            });
        }
        Ok(())
    }

    /// 删除 Deployment
    pub async fn delete_deployment(&self, key: &ObjectKey) -> Result<()> {
        self.ensure_available()?;
        self.state
            .write()
            .await
            .deployments
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Deployment {}", key)))
    }

    /// 当前全部 Deployment
    pub async fn deployments(&self) -> Vec<Deployment> {
        self.state.read().await.deployments.values().cloned().collect()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CdnCluster>> {
        self.ensure_available()?;
        Ok(self.state.read().await.clusters.get(key).cloned())
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<CdnCluster>> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .await
            .clusters
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, cluster)| cluster.clone())
            .collect())
    }

    async fn replace_cluster_status(&self, cluster: &CdnCluster) -> Result<CdnCluster> {
        self.ensure_available()?;
        let key = cluster.key();
        let mut state = self.state.write().await;
        let version = state.version + 1;
        let existing = state
            .clusters
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("CdnCluster {}", key)))?;

        if existing.metadata.resource_version != cluster.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "CdnCluster {} 的 resourceVersion 已变化",
                key
            )));
        }
        if existing.status == cluster.status {
            return Ok(existing.clone());
        }

        existing.status = cluster.status.clone();
        existing.metadata.resource_version = Some(version.to_string());
        let updated = existing.clone();
        state.version = version;
        Ok(updated)
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        self.ensure_available()?;
        Ok(self.state.read().await.deployments.get(key).cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.ensure_available()?;
        let key = object_key(deployment);
        let mut state = self.state.write().await;
        if state.deployments.contains_key(&key) {
            return Err(Error::Conflict(format!("Deployment {} 已存在", key)));
        }

        let mut created = deployment.clone();
        created.metadata.namespace = Some(key.namespace.clone());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.next_version());
        state.deployments.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.ensure_available()?;
        let key = object_key(deployment);
        let mut state = self.state.write().await;
        let version = state.version + 1;
        let existing = state
            .deployments
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("Deployment {}", key)))?;

        if existing.metadata.resource_version != deployment.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "Deployment {} 的 resourceVersion 已变化",
                key
            )));
        }

        let uid = existing.metadata.uid.clone();
        *existing = deployment.clone();
        existing.metadata.uid = uid;
        existing.metadata.resource_version = Some(version.to_string());
        let updated = existing.clone();
        state.version = version;
        Ok(updated)
    }
}
