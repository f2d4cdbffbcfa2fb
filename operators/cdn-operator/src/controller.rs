//! 控制器模块
//!
//! 该模块把协调器接入 `kube::runtime::Controller`：CdnCluster 的变更协调其自身，
//! 其拥有的 Deployment 的变更协调所有者，CdnCluster 的变更还会经由依赖映射
//! 唤醒把它声明为源的资源。调度与去重由 kube-runtime 负责，同一个键不会并发协调。
//!
//! 每次协调在独立任务中带超时执行，超时与 panic 都按可重试错误处理；
//! 可重试错误按键做指数退避，一个键的失败不会影响其他键。

use anyhow::Result;
use cdn_common::{Error, ObjectKey};
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller as KubeController;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::CdnCluster;
use crate::event_handler::dependent_refs;
use crate::metrics::OperatorMetrics;
use crate::recorder::EventRecorder;
use crate::reconcile::{ReconcileAction, Reconciler};
use crate::store::ClusterStore;

/// 按键记录连续失败次数的指数退避
struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次失败并返回下一次重试前的等待时间
    fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        let factor = 2u32.saturating_pow(*count - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// 成功或放弃后清除失败记录
    fn forget(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// 协调上下文，由 kube-runtime 在每次协调时传入
pub struct Context {
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 指标
    metrics: Arc<OperatorMetrics>,
    /// 单次协调超时
    timeout: Duration,
    /// 同时执行的协调数上限
    permits: Arc<Semaphore>,
    /// 失败退避
    backoff: Backoff,
}

impl Context {
    /// 创建协调上下文
    pub fn new(
        store: Arc<dyn ClusterStore>,
        recorder: Arc<dyn EventRecorder>,
        config: &OperatorConfig,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(store, recorder, config, metrics.clone())),
            metrics,
            timeout: config.reconcile_timeout(),
            permits: Arc::new(Semaphore::new(config.workers)),
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
        }
    }
}

/// 协调一个 CdnCluster，并把结果转换为 kube-runtime 的动作
pub async fn reconcile(cluster: Arc<CdnCluster>, ctx: Arc<Context>) -> cdn_common::Result<Action> {
    let key = cluster.key();
    let _permit = ctx
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::Transient("协调许可已关闭".into()))?;

    ctx.metrics.reconcile_started();
    let result = run_reconcile(ctx.reconciler.clone(), key.clone(), ctx.timeout).await;
    ctx.metrics.reconcile_finished();

    let action = result?;
    ctx.backoff.forget(&key);
    match action {
        ReconcileAction::Done => {
            ctx.metrics.observe_reconcile("done");
            Ok(Action::await_change())
        }
        ReconcileAction::Requeue(delay) => {
            ctx.metrics.observe_reconcile("requeue");
            Ok(Action::requeue(delay))
        }
    }
}

/// 协调失败后的处理：可重试错误按键指数退避，其余错误等待下一次变更
pub fn error_policy(cluster: Arc<CdnCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster.key();
    ctx.metrics.observe_error();

    if error.is_retryable() {
        ctx.metrics.observe_reconcile("retry");
        let delay = ctx.backoff.next_delay(&key);
        warn!(%key, %error, ?delay, "协调失败，退避后重试");
        Action::requeue(delay)
    } else {
        ctx.backoff.forget(&key);
        ctx.metrics.observe_reconcile("failed");
        error!(%key, %error, "协调失败，不再重试");
        Action::await_change()
    }
}

/// 在独立任务中执行一次协调，超时与 panic 转换为暂时性错误
async fn run_reconcile(
    reconciler: Arc<Reconciler>,
    key: ObjectKey,
    timeout: Duration,
) -> cdn_common::Result<ReconcileAction> {
    let mut task = {
        let key = key.clone();
        tokio::spawn(async move { reconciler.reconcile(&key).await })
    };

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => {
            Err(Error::Transient(format!("协调 {} 时发生 panic", key)))
        }
        Ok(Err(e)) => Err(Error::Transient(format!("协调 {} 的任务被取消: {}", key, e))),
        Err(_) => {
            task.abort();
            Err(Error::Transient(format!(
                "协调 {} 超过 {:?} 未完成",
                key, timeout
            )))
        }
    }
}

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 监听的命名空间，None 表示全部命名空间
    namespace: Option<String>,
    /// 协调上下文
    context: Arc<Context>,
    /// 通知控制器停止
    shutdown: Option<oneshot::Sender<()>>,
    /// 控制器任务
    running: Option<JoinHandle<()>>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(
        client: Client,
        store: Arc<dyn ClusterStore>,
        recorder: Arc<dyn EventRecorder>,
        config: &OperatorConfig,
        metrics: Arc<OperatorMetrics>,
    ) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            context: Arc::new(Context::new(store, recorder, config, metrics)),
            shutdown: None,
            running: None,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// 启动控制器
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            warn!("控制器已在运行");
            return Ok(());
        }

        let clusters: Api<CdnCluster> = self.api();
        let deployments: Api<Deployment> = self.api();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let controller = KubeController::new(clusters.clone(), WatcherConfig::default());
        let cache = controller.store();
        let run = controller
            .owns(deployments, WatcherConfig::default())
            .watches(clusters, WatcherConfig::default(), move |changed| {
                dependent_refs(&cache, &changed)
            })
            .graceful_shutdown_on(stopped.map(|_| ()))
            .run(reconcile, error_policy, self.context.clone())
            .for_each(|result| async move {
                match result {
                    Ok((cluster, action)) => debug!(%cluster, ?action, "协调完成"),
                    Err(e) => warn!(error = %e, "控制器错误"),
                }
            });

        self.running = Some(tokio::spawn(run));
        self.shutdown = Some(shutdown);

        info!(namespace = ?self.namespace, "CDN Operator 控制器已启动");
        Ok(())
    }

    /// 停止控制器，等待处理中的协调完成
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // 控制器任务已退出时接收端已关闭，无需处理
            let _ = shutdown.send(());
        }
        if let Some(running) = self.running.take() {
            if let Err(e) = running.await {
                error!("控制器任务异常退出: {}", e);
            }
        }

        info!("CDN Operator 控制器已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CdnClusterSource, CdnClusterSpec};
    use crate::memory::MemoryStore;
    use crate::recorder::MemoryRecorder;
    use async_trait::async_trait;
    use cdn_common::{reasons, ClusterEvent, ClusterState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> OperatorConfig {
        OperatorConfig {
            workers: 2,
            reconcile_timeout_secs: 1,
            backoff_base_ms: 10,
            backoff_max_secs: 1,
            ..Default::default()
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    fn cluster(name: &str, sources: &[&str]) -> CdnCluster {
        CdnCluster::new(
            name,
            CdnClusterSpec {
                role: "cache".into(),
                sources: sources
                    .iter()
                    .map(|source| CdnClusterSource {
                        name: source.to_string(),
                        path_condition: String::new(),
                    })
                    .collect(),
            },
        )
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        recorder: Arc<MemoryRecorder>,
        metrics: Arc<OperatorMetrics>,
        ctx: Arc<Context>,
    }

    impl Fixture {
        async fn create(&self, name: &str, sources: &[&str]) -> Arc<CdnCluster> {
            Arc::new(self.store.create_cluster(cluster(name, sources)).await.unwrap())
        }

        async fn has_deployment(&self, name: &str) -> bool {
            self.store
                .get_deployment(&key(&format!("{}-deployment", name)))
                .await
                .unwrap()
                .is_some()
        }

        fn metrics_text(&self) -> String {
            self.metrics.render().unwrap()
        }
    }

    fn fixture_with(
        config: OperatorConfig,
        recorder: Arc<dyn EventRecorder>,
        memory: Arc<MemoryRecorder>,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(OperatorMetrics::new().unwrap());
        let ctx = Arc::new(Context::new(store.clone(), recorder, &config, metrics.clone()));
        Fixture {
            store,
            recorder: memory,
            metrics,
            ctx,
        }
    }

    fn fixture(config: OperatorConfig) -> Fixture {
        let recorder = Arc::new(MemoryRecorder::new());
        fixture_with(config, recorder.clone(), recorder)
    }

    /// 对指定资源发布事件前先等待一段时间
    struct SlowRecorder {
        inner: Arc<MemoryRecorder>,
        target: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl EventRecorder for SlowRecorder {
        async fn publish(&self, cluster: &CdnCluster, event: &ClusterEvent) {
            if cluster.key().name == self.target {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.publish(cluster, event).await;
        }
    }

    /// 对名为 `boom` 的资源第一次发布事件时 panic
    struct PanickingRecorder {
        inner: Arc<MemoryRecorder>,
        panics: AtomicUsize,
    }

    #[async_trait]
    impl EventRecorder for PanickingRecorder {
        async fn publish(&self, cluster: &CdnCluster, event: &ClusterEvent) {
            if cluster.key().name == "boom" && self.panics.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("recorder exploded");
            }
            self.inner.publish(cluster, event).await;
        }
    }

    #[tokio::test]
    async fn test_reconcile_maps_actions() {
        let f = fixture(OperatorConfig {
            source_retry_secs: 60,
            ..test_config()
        });
        let foo2 = f.create("foo2", &[]).await;
        let foo3 = f.create("foo3", &["asource"]).await;

        assert_eq!(reconcile(foo2, f.ctx.clone()).await.unwrap(), Action::await_change());
        assert_eq!(
            reconcile(foo3, f.ctx.clone()).await.unwrap(),
            Action::requeue(Duration::from_secs(60))
        );

        let text = f.metrics_text();
        assert!(text.contains("cdn_operator_reconciliations_total{outcome=\"done\"} 1"));
        assert!(text.contains("cdn_operator_reconciliations_total{outcome=\"requeue\"} 1"));
        assert!(text.contains("cdn_operator_reconciles_in_flight 0"));
    }

    #[tokio::test]
    async fn test_dependency_wake_up_through_reconcile() {
        let f = fixture(OperatorConfig {
            source_retry_secs: 0,
            ..test_config()
        });
        let foo3 = f.create("foo3", &["asource"]).await;
        reconcile(foo3.clone(), f.ctx.clone()).await.unwrap();
        assert!(!f.has_deployment("foo3").await);

        let asource = f.create("asource", &[]).await;
        reconcile(asource, f.ctx.clone()).await.unwrap();
        reconcile(foo3, f.ctx.clone()).await.unwrap();

        assert!(f.has_deployment("foo3").await);
        let state = f.store.get_cluster(&key("foo3")).await.unwrap().unwrap().state();
        assert_eq!(state, ClusterState::Deploying);
        assert_eq!(f.recorder.count(&key("foo3"), reasons::DEPLOYMENT_CREATED).await, 1);
    }

    #[tokio::test]
    async fn test_slow_reconcile_times_out_without_blocking_others() {
        let memory = Arc::new(MemoryRecorder::new());
        let recorder = Arc::new(SlowRecorder {
            inner: memory.clone(),
            target: "slow",
            delay: Duration::from_secs(5),
        });
        let f = fixture_with(test_config(), recorder, memory);
        let slow = f.create("slow", &[]).await;
        let fast = f.create("fast", &[]).await;

        let pending = tokio::spawn(reconcile(slow.clone(), f.ctx.clone()));
        let fast_action = tokio::time::timeout(
            Duration::from_millis(500),
            reconcile(fast, f.ctx.clone()),
        )
        .await
        .expect("其他资源的协调不应被阻塞")
        .unwrap();
        assert_eq!(fast_action, Action::await_change());
        assert!(f.has_deployment("fast").await);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(
            error_policy(slow.clone(), &err, f.ctx.clone()),
            Action::requeue(Duration::from_millis(10))
        );
        assert_eq!(
            error_policy(slow, &err, f.ctx.clone()),
            Action::requeue(Duration::from_millis(20))
        );

        let text = f.metrics_text();
        assert!(text.contains("cdn_operator_reconciliations_total{outcome=\"retry\"} 2"));
        assert!(text.contains("cdn_operator_reconciles_in_flight 0"));
    }

    #[tokio::test]
    async fn test_workers_bound_concurrent_reconciles() {
        let memory = Arc::new(MemoryRecorder::new());
        let recorder = Arc::new(SlowRecorder {
            inner: memory.clone(),
            target: "slow",
            delay: Duration::from_millis(300),
        });
        let f = fixture_with(
            OperatorConfig {
                workers: 1,
                reconcile_timeout_secs: 5,
                ..test_config()
            },
            recorder,
            memory,
        );
        let slow = f.create("slow", &[]).await;
        let fast = f.create("fast", &[]).await;

        let pending = tokio::spawn(reconcile(slow, f.ctx.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), reconcile(fast.clone(), f.ctx.clone()))
                .await;
        assert!(blocked.is_err());

        pending.await.unwrap().unwrap();
        reconcile(fast, f.ctx.clone()).await.unwrap();
        assert!(f.has_deployment("fast").await);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_and_retried() {
        let memory = Arc::new(MemoryRecorder::new());
        let recorder = Arc::new(PanickingRecorder {
            inner: memory.clone(),
            panics: AtomicUsize::new(0),
        });
        let f = fixture_with(test_config(), recorder.clone(), memory);
        let boom = f.create("boom", &[]).await;
        let foo2 = f.create("foo2", &[]).await;

        let err = reconcile(boom.clone(), f.ctx.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            error_policy(boom.clone(), &err, f.ctx.clone()),
            Action::requeue(Duration::from_millis(10))
        );

        reconcile(foo2, f.ctx.clone()).await.unwrap();
        assert_eq!(reconcile(boom, f.ctx.clone()).await.unwrap(), Action::await_change());
        assert!(f.has_deployment("boom").await);
        assert!(f.has_deployment("foo2").await);
        assert_eq!(recorder.panics.load(Ordering::SeqCst), 1);
        assert!(f.metrics_text().contains("outcome=\"retry\""));
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let f = fixture(OperatorConfig {
            backoff_base_ms: 100,
            backoff_max_secs: 1,
            ..test_config()
        });
        let foo5 = f.create("foo5", &[]).await;
        f.store.set_available(false);

        let mut delays = Vec::new();
        for _ in 0..6 {
            let err = reconcile(foo5.clone(), f.ctx.clone()).await.unwrap_err();
            delays.push(error_policy(foo5.clone(), &err, f.ctx.clone()));
        }
        let expected: Vec<Action> = [100, 200, 400, 800, 1000, 1000]
            .into_iter()
            .map(|ms| Action::requeue(Duration::from_millis(ms)))
            .collect();
        assert_eq!(delays, expected);

        f.store.set_available(true);
        reconcile(foo5.clone(), f.ctx.clone()).await.unwrap();
        assert!(f.has_deployment("foo5").await);

        f.store.set_available(false);
        let err = reconcile(foo5.clone(), f.ctx.clone()).await.unwrap_err();
        assert_eq!(
            error_policy(foo5, &err, f.ctx.clone()),
            Action::requeue(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_permanent_error_awaits_change() {
        let f = fixture(test_config());
        let foo = Arc::new(cluster("foo", &[]));

        let action = error_policy(foo, &Error::Config("bad".into()), f.ctx.clone());

        assert_eq!(action, Action::await_change());
        let text = f.metrics_text();
        assert!(text.contains("cdn_operator_reconciliations_total{outcome=\"failed\"} 1"));
        assert!(text.contains("cdn_operator_reconcile_errors_total 1"));
    }
}
