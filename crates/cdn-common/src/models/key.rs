//! 协调请求键
//!
//! `ObjectKey` 以命名空间和名称标识一个待协调的 CdnCluster。
//! 同一个键的多次请求可以合并为一次协调。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 协调请求键（命名空间 + 名称）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// 资源命名空间
    pub namespace: String,
    /// 资源名称
    pub name: String,
}

impl ObjectKey {
    /// 创建新的协调请求键
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// 同一命名空间下的另一个资源
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
