//! CDN Operator Common - 跨模块共享的错误类型与数据结构
//!
//! 该模块提供 CDN Operator 各组件共享的数据结构和统一的错误处理机制，
//! 包括协调请求键、CdnCluster 状态枚举以及用户可见事件的原因代码。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::event::*;
pub use models::key::*;
pub use models::state::*;
