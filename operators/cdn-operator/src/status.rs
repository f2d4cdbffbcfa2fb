//! 状态写入模块
//!
//! 协调器是 `status.state` 的唯一写入者，但读取到的对象可能已经落后于外部写入。
//! 写入带 resourceVersion，遇到版本冲突时重新读取最新对象并重试。

use cdn_common::{ClusterState, Error, Result};
use std::sync::Arc;
use tracing::debug;

use crate::crd::{CdnCluster, CdnClusterStatus};
use crate::store::ClusterStore;

/// 状态写入器
#[derive(Clone)]
pub struct StatusWriter {
    /// 资源存储
    store: Arc<dyn ClusterStore>,
    /// 版本冲突时的重试次数
    retries: usize,
}

impl StatusWriter {
    /// 创建新的状态写入器
    pub fn new(store: Arc<dyn ClusterStore>, retries: usize) -> Self {
        Self { store, retries }
    }

    /// 写入 `status.state`，返回写入后的对象；资源已被删除时返回 None
    pub async fn write_state(
        &self,
        cluster: &CdnCluster,
        state: ClusterState,
    ) -> Result<Option<CdnCluster>> {
        let key = cluster.key();
        let mut current = cluster.clone();

        for attempt in 0..=self.retries {
            let mut desired = current;
            desired.status = Some(CdnClusterStatus {
                state: state.as_str().to_string(),
            });

            match self.store.replace_cluster_status(&desired).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() => {
                    if attempt == self.retries {
                        break;
                    }
                    debug!(%key, attempt, "状态写入版本冲突，重新读取");
                    match self.store.get_cluster(&key).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(None),
                    }
                }
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "CdnCluster {} 状态写入在 {} 次重试后仍然冲突",
            key, self.retries
        )))
    }
}
