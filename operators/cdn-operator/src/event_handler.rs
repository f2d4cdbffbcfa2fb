//! 事件映射模块
//!
//! 该模块把 CdnCluster 的变更映射为依赖方的协调请求。控制器自身的 watcher
//! 已经会协调变更的资源，Deployment 的变更通过所有者引用映射回其 CdnCluster，
//! 这里只补充"谁把它声明为源"这一条边。
//!
//! 依赖方从控制器的反射器缓存中查找，不访问 API Server，因此映射不会失败，
//! 也不会阻塞 watcher。缓存重新列举时，控制器会重新协调全部对象，
//! 缓存尚未同步期间遗漏的依赖方由此补上。

use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use tracing::debug;

use crate::crd::CdnCluster;
use crate::dependency::dependents_of;

/// 计算 `changed` 变更后需要重新协调的依赖方
///
/// 删除的资源同样适用：它已不在缓存中，但依赖它的资源仍在。
pub fn dependent_refs(cache: &Store<CdnCluster>, changed: &CdnCluster) -> Vec<ObjectRef<CdnCluster>> {
    let key = changed.key();
    let snapshot = cache.state();
    let dependents = dependents_of(&key, snapshot.iter().map(Arc::as_ref));

    if !dependents.is_empty() {
        debug!(%key, count = dependents.len(), "唤醒依赖该资源的 CdnCluster");
    }
    dependents
        .into_iter()
        .map(|dependent| ObjectRef::new(&dependent.name).within(&dependent.namespace))
        .collect()
}
