//! 用户可见事件模型
//!
//! 协调器在每次状态迁移时发出一个事件，说明迁移的原因。
//! 事件消息是面向操作人员的文本，格式保持稳定。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 事件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSeverity {
    /// 正常
    Normal,
    /// 警告
    Warning,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

/// 事件原因代码
pub mod reasons {
    /// 声明的源不存在
    pub const SOURCE_NOT_FOUND: &str = "SourceNotFound";
    /// 源之间存在循环依赖
    pub const SOURCE_CYCLE: &str = "SourceCycle";
    /// 资源定义无效
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// 工作负载已创建
    pub const DEPLOYMENT_CREATED: &str = "DeploymentCreated";
    /// 工作负载已按期望状态更新
    pub const DEPLOYMENT_UPDATED: &str = "DeploymentUpdated";
    /// API Server 拒绝了工作负载
    pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";
}

/// 关于某个 CdnCluster 的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// 事件级别
    pub severity: EventSeverity,
    /// 原因代码（PascalCase）
    pub reason: String,
    /// 消息文本
    pub message: String,
}

impl ClusterEvent {
    /// 声明的源不存在
    pub fn source_not_found(source: &str) -> Self {
        Self::warning(
            reasons::SOURCE_NOT_FOUND,
            format!("Source {} not found, will retry later", source),
        )
    }

    /// 检测到循环依赖，`path` 为 `a -> b -> a` 形式的依赖路径
    pub fn source_cycle(path: &[String]) -> Self {
        Self::warning(
            reasons::SOURCE_CYCLE,
            format!("Source cycle detected: {}", path.join(" -> ")),
        )
    }

    /// 资源定义无效
    pub fn invalid_spec(detail: impl Into<String>) -> Self {
        Self::warning(reasons::INVALID_SPEC, detail.into())
    }

    /// 工作负载已创建
    pub fn deployment_created(deployment: &str) -> Self {
        Self::normal(
            reasons::DEPLOYMENT_CREATED,
            format!("The Deployment {} has been created", deployment),
        )
    }

    /// 工作负载已更新
    pub fn deployment_updated(deployment: &str) -> Self {
        Self::normal(
            reasons::DEPLOYMENT_UPDATED,
            format!("The Deployment {} has been updated", deployment),
        )
    }

    /// 工作负载被拒绝，修改规范前不会重试
    pub fn deployment_failed(deployment: &str, detail: impl fmt::Display) -> Self {
        Self::warning(
            reasons::DEPLOYMENT_FAILED,
            format!("The Deployment {} could not be applied: {}", deployment, detail),
        )
    }

    fn normal(reason: &str, message: String) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            message,
        }
    }

    fn warning(reason: &str, message: String) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            message,
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.severity, self.reason, self.message)
    }
}
