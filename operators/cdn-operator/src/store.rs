//! 资源存储客户端模块
//!
//! 该模块定义了协调器访问 CdnCluster 与 Deployment 的接口，并提供基于
//! kube-rs 的实现。写操作都带有 resourceVersion，由 API Server 做乐观并发校验。
//! 变更监听不在这里，由控制器的 watcher 负责。

use async_trait::async_trait;
use cdn_common::{Error, ObjectKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, PostParams},
    client::Client,
    Resource,
};

#[cfg(test)]
use mockall::automock;

use crate::crd::CdnCluster;

/// 协调器使用的存储接口
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// 获取 CdnCluster，不存在时返回 None
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CdnCluster>>;

    /// 列出命名空间中的全部 CdnCluster
    async fn list_clusters(&self, namespace: &str) -> Result<Vec<CdnCluster>>;

    /// 按 resourceVersion 校验后替换 CdnCluster 的状态
    async fn replace_cluster_status(&self, cluster: &CdnCluster) -> Result<CdnCluster>;

    /// 获取 Deployment，不存在时返回 None
    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>>;

    /// 创建 Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// 按 resourceVersion 校验后替换 Deployment
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
}

/// 将 kube 客户端错误归类为统一错误类型
pub fn classify_kube_error(err: kube::Error, what: &str) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("{}: {}", what, resp.message))
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("{}: {}", what, resp.message))
        }
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
            Error::Invalid(format!("{}: {}", what, resp.message))
        }
        other => Error::Transient(format!("{}: {}", what, other)),
    }
}

/// 基于 kube-rs 的存储实现
#[derive(Clone)]
pub struct KubeStore {
    /// Kubernetes 客户端
    client: Client,
}

impl KubeStore {
    /// 创建新的存储客户端
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CdnCluster>> {
        self.namespaced::<CdnCluster>(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify_kube_error(e, &format!("获取 CdnCluster {}", key)))
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<CdnCluster>> {
        let list = self
            .namespaced::<CdnCluster>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube_error(e, &format!("列出命名空间 {} 的 CdnCluster", namespace)))?;
        Ok(list.items)
    }

    async fn replace_cluster_status(&self, cluster: &CdnCluster) -> Result<CdnCluster> {
        let key = cluster.key();
        let data = serde_json::to_vec(cluster)?;
        self.namespaced::<CdnCluster>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| classify_kube_error(e, &format!("更新 CdnCluster {} 状态", key)))
    }

    async fn get_deployment(&self, key: &ObjectKey) -> Result<Option<Deployment>> {
        self.namespaced::<Deployment>(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify_kube_error(e, &format!("获取 Deployment {}", key)))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = crate::crd::object_key(deployment);
        self.namespaced::<Deployment>(&key.namespace)
            .create(&PostParams::default(), deployment)
            .await
            .map_err(|e| classify_kube_error(e, &format!("创建 Deployment {}", key)))
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = crate::crd::object_key(deployment);
        self.namespaced::<Deployment>(&key.namespace)
            .replace(&key.name, &PostParams::default(), deployment)
            .await
            .map_err(|e| classify_kube_error(e, &format!("替换 Deployment {}", key)))
    }
}
