//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置。配置来源按优先级从低到高依次为：
//! 内置默认值、YAML/JSON 配置文件、以 `CDN_OPERATOR` 为前缀的环境变量
//! （嵌套字段使用 `__` 分隔，例如 `CDN_OPERATOR__WORKLOAD__IMAGE`）。

use cdn_common::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Operator 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// 同时执行的协调数上限
    pub workers: usize,
    /// 单次协调的超时时间（秒）
    pub reconcile_timeout_secs: u64,
    /// 等待源时的兜底重新协调间隔（秒），0 表示只依赖事件触发
    pub source_retry_secs: u64,
    /// 已收敛资源的周期性重新协调间隔（秒），0 表示关闭
    pub resync_secs: u64,
    /// 失败退避的初始间隔（毫秒）
    pub backoff_base_ms: u64,
    /// 失败退避的最大间隔（秒）
    pub backoff_max_secs: u64,
    /// 状态写入遇到版本冲突时的重试次数
    pub status_retries: usize,
    /// 事件上报使用的控制器名称
    pub controller_name: String,
    /// 监听的命名空间，未设置时监听全部命名空间
    pub namespace: Option<String>,
    /// 工作负载配置
    pub workload: WorkloadConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
}

/// 工作负载配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// 容器镜像
    pub image: String,
    /// 副本数
    pub replicas: i32,
    /// 容器端口
    pub container_port: i32,
}

/// 指标服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 是否启用
    pub enabled: bool,
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout_secs: 30,
            source_retry_secs: 60,
            resync_secs: 0,
            backoff_base_ms: 100,
            backoff_max_secs: 300,
            status_retries: 5,
            controller_name: "cdn-operator".to_string(),
            namespace: None,
            workload: WorkloadConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            image: "nginx:1.25".to_string(),
            replicas: 1,
            container_port: 80,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl OperatorConfig {
    /// 加载配置，`path` 为空时只使用默认值与环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let config_file = path
                .to_str()
                .ok_or_else(|| Error::Config(format!("配置路径无效: {:?}", path)))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::Config(
                        "不支持的配置文件格式，仅支持 YAML 或 JSON".into(),
                    ))
                }
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("CDN_OPERATOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("构建配置失败: {}", e)))?;

        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .map_err(|e| Error::Config(format!("配置格式错误: {}", e)))?;

        operator_config.validate()?;
        Ok(operator_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers 必须大于 0".into()));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::Config("reconcile_timeout_secs 必须大于 0".into()));
        }
        if self.workload.replicas <= 0 {
            return Err(Error::Config("workload.replicas 必须大于 0".into()));
        }
        if self.workload.image.is_empty() {
            return Err(Error::Config("workload.image 不能为空".into()));
        }
        Ok(())
    }

    /// 单次协调的超时时间
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// 等待源时的兜底重新协调间隔
    pub fn source_retry(&self) -> Option<Duration> {
        non_zero_secs(self.source_retry_secs)
    }

    /// 已收敛资源的周期性重新协调间隔
    pub fn resync(&self) -> Option<Duration> {
        non_zero_secs(self.resync_secs)
    }

    /// 失败退避的初始间隔
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// 失败退避的最大间隔
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
