//! CdnCluster 状态模型
//!
//! `status.state` 在资源上以字符串保存，空字符串表示尚未协调。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// CdnCluster 的观测状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClusterState {
    /// 初始状态，尚未协调
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// 存在未解析的源
    WaitingSource,
    /// 所有源均已解析，工作负载已创建或已确认存在
    Deploying,
}

impl ClusterState {
    /// 写入 `status.state` 的字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Unknown => "",
            ClusterState::WaitingSource => "WaitingSource",
            ClusterState::Deploying => "Deploying",
        }
    }

    /// 解析资源上的状态字符串，无法识别的值视为 Unknown
    pub fn from_status(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Unknown => write!(f, "Unknown"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for ClusterState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "Unknown" => Ok(ClusterState::Unknown),
            "WaitingSource" => Ok(ClusterState::WaitingSource),
            "Deploying" => Ok(ClusterState::Deploying),
            _ => Err(Error::Serialization(format!("无效的集群状态: {}", s))),
        }
    }
}
