//! 事件上报模块
//!
//! 协调器通过 `EventRecorder` 发出与 CdnCluster 关联的用户可见事件
//! （可通过 `kubectl describe` 查看）。事件上报不影响协调结果：
//! 失败只记录警告日志，不向调用方返回错误。

use async_trait::async_trait;
use cdn_common::{ClusterEvent, EventSeverity};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::CdnCluster;

#[cfg(any(test, feature = "testing"))]
pub use self::memory::MemoryRecorder;

/// 事件动作
const RECONCILE_ACTION: &str = "Reconcile";

/// 事件上报接口
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// 发出关于 `cluster` 的事件
    async fn publish(&self, cluster: &CdnCluster, event: &ClusterEvent);
}

/// 基于 `kube::runtime::events::Recorder` 的实现
pub struct KubeEventRecorder {
    /// Kubernetes 客户端
    client: Client,
    /// 上报组件
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// 创建新的事件上报器，`controller_name` 显示为事件的 reportingComponent
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, cluster: &CdnCluster, event: &ClusterEvent) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            cluster.object_ref(&()),
        );
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let result = recorder
            .publish(Event {
                type_,
                reason: event.reason.clone(),
                note: Some(event.message.clone()),
                action: RECONCILE_ACTION.to_string(),
                secondary: None,
            })
            .await;

        if let Err(e) = result {
            warn!(
                key = %cluster.key(),
                reason = %event.reason,
                error = %e,
                "发布事件失败"
            );
        }
    }
}

#[cfg(any(test, feature = "testing"))]
mod memory {
    use super::EventRecorder;
    use crate::crd::CdnCluster;
    use async_trait::async_trait;
    use cdn_common::{ClusterEvent, ObjectKey};
    use tokio::sync::Mutex;
    use tracing::debug;

    /// 在内存中保存事件的实现，用于测试与本地演练
    #[derive(Default)]
    pub struct MemoryRecorder {
        /// 已发出的事件
        events: Mutex<Vec<(ObjectKey, ClusterEvent)>>,
    }

    impl MemoryRecorder {
        /// 创建新的内存事件上报器
        pub fn new() -> Self {
            Self::default()
        }

        /// 全部事件，格式为 `"<Type> <Reason> <message>"`
        pub async fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .await
                .iter()
                .map(|(_, event)| event.to_string())
                .collect()
        }

        /// 关于某个资源的事件
        pub async fn events_for(&self, key: &ObjectKey) -> Vec<ClusterEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|(involved, _)| involved == key)
                .map(|(_, event)| event.clone())
                .collect()
        }

        /// 某个资源上指定原因的事件数量
        pub async fn count(&self, key: &ObjectKey, reason: &str) -> usize {
            self.events_for(key)
                .await
                .iter()
                .filter(|event| event.reason == reason)
                .count()
        }
    }

    #[async_trait]
    impl EventRecorder for MemoryRecorder {
        async fn publish(&self, cluster: &CdnCluster, event: &ClusterEvent) {
            debug!(key = %cluster.key(), event = %event, "记录事件");
            self.events.lock().await.push((cluster.key(), event.clone()));
        }
    }
}
