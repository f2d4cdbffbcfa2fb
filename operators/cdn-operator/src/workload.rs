//! 工作负载构建模块
//!
//! 根据 CdnCluster 的角色与源生成期望的 Deployment。Deployment 的名称由集群名称
//! 确定性派生，不保存任何需要在重建之间保留的状态。源列表作为配置原样传入容器，
//! Operator 不解释其中的路由条件。

use cdn_common::{Error, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::config::WorkloadConfig;
use crate::crd::CdnCluster;
use crate::utils::sha256_hash;

/// 期望规范的哈希注解
pub const SPEC_HASH_ANNOTATION: &str = "cluster.anevia.com/spec-hash";

/// 标识所属 CdnCluster 的标签
pub const CLUSTER_LABEL: &str = "cluster.anevia.com/cdncluster";

/// 容器名称
const CONTAINER_NAME: &str = "cdn";

/// 标签值的最大长度
const MAX_LABEL_VALUE: usize = 63;

/// 截断时保留的哈希长度
const LABEL_HASH_LEN: usize = 10;

/// 由集群名称派生的 Deployment 名称
pub fn deployment_name(cluster_name: &str) -> String {
    format!("{}-deployment", cluster_name)
}

/// 把任意名称转换为合法的标签值
///
/// 超过 63 个字符时保留前缀并追加原值哈希，不同的长名称仍然得到不同的标签值。
pub fn label_value(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE {
        return value.to_string();
    }
    let keep = MAX_LABEL_VALUE - LABEL_HASH_LEN - 1;
    let prefix = value
        .get(..keep)
        .unwrap_or(value)
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    let hash = sha256_hash(value.as_bytes());
    format!("{}-{}", prefix, &hash[..LABEL_HASH_LEN])
}

/// 构建 CdnCluster 期望的 Deployment，带有指向该集群的控制者引用
pub fn build_deployment(cluster: &CdnCluster, settings: &WorkloadConfig) -> Result<Deployment> {
    let cluster_name = cluster.name_any();
    let name = deployment_name(&cluster_name);
    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::Invalid(format!("CdnCluster {} 缺少 uid，无法建立所有者引用", cluster.key()))
    })?;

    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), label_value(&cluster_name)),
        ("deployment".to_string(), label_value(&name)),
    ]);
    let mut labels = selector.clone();
    labels.extend([
        ("app.kubernetes.io/name".to_string(), "cdn-cluster".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "cdn-operator".to_string()),
    ]);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(settings.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: settings.container_port,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "CDN_ROLE".to_string(),
                value: Some(cluster.spec.role.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "CDN_SOURCES".to_string(),
                value: Some(serde_json::to_string(&cluster.spec.sources)?),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let spec = DeploymentSpec {
        replicas: Some(settings.replicas),
        selector: LabelSelector {
            match_labels: Some(selector),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels.clone()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                ..Default::default()
            }),
        },
        ..Default::default()
    };
    let hash = sha256_hash(&serde_json::to_vec(&spec)?);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(SPEC_HASH_ANNOTATION.to_string(), hash)])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

/// 现有 Deployment 是否偏离期望规范
///
/// 只比较哈希注解，API Server 填充的默认字段不会被视为偏离。
pub fn needs_update(existing: &Deployment, desired: &Deployment) -> bool {
    existing.annotations().get(SPEC_HASH_ANNOTATION)
        != desired.annotations().get(SPEC_HASH_ANNOTATION)
}

/// 基于现有对象的 resourceVersion 准备替换用的 Deployment
pub fn replacement_for(existing: &Deployment, desired: &Deployment) -> Deployment {
    let mut replacement = desired.clone();
    replacement.metadata.resource_version = existing.resource_version();
    replacement
}
