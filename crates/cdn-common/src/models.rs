//! 数据模型模块
//!
//! 该模块定义了 CDN Operator 中使用的核心数据模型，包括协调请求键、
//! 资源状态以及事件描述。

pub mod key;
pub mod state;
pub mod event;
