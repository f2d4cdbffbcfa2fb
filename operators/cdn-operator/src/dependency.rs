//! 依赖索引模块
//!
//! 源只按名称引用，资源上不保存反向边。要找到"谁依赖我"，只能扫描同一命名空间的
//! 全部 CdnCluster。扫描的对象可以是控制器的本地缓存，也可以是一次列表结果，
//! 不持久化任何图结构。

use cdn_common::{ObjectKey, Result};
use kube::ResourceExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::crd::CdnCluster;
use crate::store::ClusterStore;

/// 返回 `listing` 中声明 `changed` 为源的资源，结果有序且去重，不包含 `changed` 本身
pub fn dependents_of<'a, I>(changed: &ObjectKey, listing: I) -> Vec<ObjectKey>
where
    I: IntoIterator<Item = &'a CdnCluster>,
{
    listing
        .into_iter()
        .map(|cluster| (cluster.key(), cluster))
        .filter(|(key, _)| key.namespace == changed.namespace && key.name != changed.name)
        .filter(|(_, cluster)| {
            cluster
                .spec
                .sources
                .iter()
                .any(|source| source.name == changed.name)
        })
        .map(|(key, _)| key)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// 查找经过 `root` 的依赖环，返回 `root -> ... -> root` 形式的路径
///
/// 只考虑 `listing` 中存在的资源，指向不存在资源的源不构成环。
pub fn find_cycle(root: &str, listing: &[CdnCluster]) -> Option<Vec<String>> {
    let graph: HashMap<String, Vec<String>> = listing
        .iter()
        .map(|cluster| {
            let edges = cluster
                .spec
                .sources
                .iter()
                .map(|source| source.name.clone())
                .collect();
            (cluster.name_any(), edges)
        })
        .collect();

    let mut path = vec![root.to_string()];
    let mut visited = BTreeSet::new();
    if walk(root, root, &graph, &mut path, &mut visited) {
        Some(path)
    } else {
        None
    }
}

fn walk(
    current: &str,
    root: &str,
    graph: &HashMap<String, Vec<String>>,
    path: &mut Vec<String>,
    visited: &mut BTreeSet<String>,
) -> bool {
    let Some(edges) = graph.get(current) else {
        return false;
    };
    for next in edges {
        if next == root {
            path.push(next.clone());
            return true;
        }
        if !graph.contains_key(next) || !visited.insert(next.clone()) {
            continue;
        }
        path.push(next.clone());
        if walk(next, root, graph, path, visited) {
            return true;
        }
        path.pop();
    }
    false
}

/// 基于存储列表的环检测
#[derive(Clone)]
pub struct DependencyIndex {
    /// 资源存储
    store: Arc<dyn ClusterStore>,
}

impl DependencyIndex {
    /// 创建新的依赖索引
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// 列出命名空间并查找经过 `key` 的依赖环
    pub async fn cycle_through(&self, key: &ObjectKey) -> Result<Option<Vec<String>>> {
        let listing = self.store.list_clusters(&key.namespace).await?;
        Ok(find_cycle(&key.name, &listing))
    }
}
