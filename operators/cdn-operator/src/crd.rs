//! 自定义资源定义模块
//!
//! 该模块定义了 CdnCluster 自定义资源。每个 CdnCluster 声明一个角色和一组
//! 按名称引用的上游源（同一命名空间中的其他 CdnCluster），
//! 状态字段只由协调器写入。

use cdn_common::{ClusterState, ObjectKey};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CDN 集群规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.anevia.com",
    version = "v1",
    kind = "CdnCluster",
    plural = "cdnclusters",
    namespaced,
    status = "CdnClusterStatus",
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CdnClusterSpec {
    /// 集群角色，例如 "balancer" 或 "cache"
    #[serde(default)]
    pub role: String,

    /// 上游源列表，按声明顺序解析
    #[serde(default)]
    pub sources: Vec<CdnClusterSource>,
}

/// 上游源引用
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CdnClusterSource {
    /// 同一命名空间中另一个 CdnCluster 的名称
    pub name: String,

    /// 路由匹配条件，作为配置原样传递给工作负载
    #[serde(default)]
    pub path_condition: String,
}

/// CDN 集群状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CdnClusterStatus {
    /// 状态："" / WaitingSource / Deploying
    #[serde(default)]
    pub state: String,
}

impl CdnCluster {
    /// 当前观测状态，缺失或无法识别时为 Unknown
    pub fn state(&self) -> ClusterState {
        self.status
            .as_ref()
            .map(|status| ClusterState::from_status(&status.state))
            .unwrap_or_default()
    }

    /// 协调请求键
    pub fn key(&self) -> ObjectKey {
        object_key(self)
    }
}

/// 任意命名空间资源的协调请求键，未设置命名空间时为 "default"
pub fn object_key<K: ResourceExt>(obj: &K) -> ObjectKey {
    ObjectKey::new(
        obj.namespace().unwrap_or_else(|| "default".into()),
        obj.name_any(),
    )
}
