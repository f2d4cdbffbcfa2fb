//! 错误处理模块
//!
//! 该模块提供 CDN Operator 的统一错误类型。错误按照处理方式分类：
//! NotFound 驱动状态迁移，Conflict 在本次协调内重读重试，
//! Transient 交给调度器退避重试，Invalid 通过事件上报且不再重试。

use thiserror::Error;

/// CDN Operator 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 乐观并发版本冲突
    #[error("版本冲突: {0}")]
    Conflict(String),

    /// 暂时性错误（网络、存储不可用、超时）
    #[error("暂时性错误: {0}")]
    Transient(String),

    /// 资源定义无效，修改前不会重试
    #[error("无效的资源定义: {0}")]
    Invalid(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 序列化/反序列化错误
    #[error("序列化/反序列化错误: {0}")]
    Serialization(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 是否应由调度器退避后重新协调
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transient(_))
    }

    /// 是否为资源不存在
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为版本冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// CDN Operator 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
