//! 指标收集与导出模块
//!
//! 该模块统计协调次数、失败次数、创建的工作负载数量与执行中的协调数，
//! 并通过 HTTP 以 Prometheus 文本格式导出，同时提供 `/healthz` 探针端点。

use cdn_common::{Error, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Operator 指标
pub struct OperatorMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 按结果统计的协调次数
    reconciliations: IntCounterVec,
    /// 协调失败次数
    reconcile_errors: IntCounter,
    /// 创建的 Deployment 数量
    deployments_created: IntCounter,
    /// 正在执行的协调数量
    in_flight: IntGauge,
}

impl OperatorMetrics {
    /// 创建并注册指标
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "cdn_operator_reconciliations_total",
                "Total number of CdnCluster reconciliations by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let reconcile_errors = IntCounter::new(
            "cdn_operator_reconcile_errors_total",
            "Total number of failed CdnCluster reconciliations",
        )
        .map_err(metrics_error)?;
        let deployments_created = IntCounter::new(
            "cdn_operator_deployments_created_total",
            "Total number of Deployments created for CdnClusters",
        )
        .map_err(metrics_error)?;
        let in_flight = IntGauge::new(
            "cdn_operator_reconciles_in_flight",
            "Number of CdnCluster reconciliations currently running",
        )
        .map_err(metrics_error)?;

        // 注册指标
        registry
            .register(Box::new(reconciliations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_errors.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(deployments_created.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_errors,
            deployments_created,
            in_flight,
        })
    }

    /// 记录一次协调结果
    pub fn observe_reconcile(&self, outcome: &str) {
        self.reconciliations.with_label_values(&[outcome]).inc();
    }

    /// 记录一次协调失败
    pub fn observe_error(&self) {
        self.reconcile_errors.inc();
    }

    /// 记录一次 Deployment 创建
    pub fn observe_deployment_created(&self) {
        self.deployments_created.inc();
    }

    /// 一次协调开始执行
    pub fn reconcile_started(&self) {
        self.in_flight.inc();
    }

    /// 一次协调执行结束
    pub fn reconcile_finished(&self) {
        self.in_flight.dec();
    }

    /// 以 Prometheus 文本格式导出全部指标
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn respond(&self, path: &str) -> Response<Body> {
        match path {
            "/metrics" => match self.render() {
                Ok(body) => {
                    let mut response = Response::new(Body::from(body));
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(prometheus::TEXT_FORMAT),
                    );
                    response
                }
                Err(e) => {
                    error!("导出指标失败: {}", e);
                    status_response(StatusCode::INTERNAL_SERVER_ERROR, "error")
                }
            },
            "/healthz" => status_response(StatusCode::OK, "ok"),
            _ => status_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// 启动指标服务器
    pub fn spawn_server(self: &Arc<Self>, addr: SocketAddr) -> Result<JoinHandle<()>> {
        let builder = Server::try_bind(&addr)
            .map_err(|e| Error::Config(format!("无法监听指标地址 {}: {}", addr, e)))?;
        let metrics = self.clone();

        let make_svc = make_service_fn(move |_| {
            let metrics = metrics.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(metrics.respond(request.uri().path())) }
                }))
            }
        });

        info!("指标服务器启动在 {}", addr);
        Ok(tokio::spawn(async move {
            if let Err(e) = builder.serve(make_svc).await {
                error!("指标服务器错误: {}", e);
            }
        }))
    }
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Config(format!("指标注册失败: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_observations() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.observe_reconcile("done");
        metrics.observe_reconcile("done");
        metrics.observe_deployment_created();
        metrics.reconcile_started();
        metrics.reconcile_started();
        metrics.reconcile_finished();

        let text = metrics.render().unwrap();
        assert!(text.contains("cdn_operator_reconciliations_total{outcome=\"done\"} 2"));
        assert!(text.contains("cdn_operator_deployments_created_total 1"));
        assert!(text.contains("cdn_operator_reconciles_in_flight 1"));
    }

    #[test]
    fn test_respond_routes() {
        let metrics = OperatorMetrics::new().unwrap();
        assert_eq!(metrics.respond("/healthz").status(), StatusCode::OK);
        assert_eq!(metrics.respond("/metrics").status(), StatusCode::OK);
        assert_eq!(metrics.respond("/other").status(), StatusCode::NOT_FOUND);
    }
}
