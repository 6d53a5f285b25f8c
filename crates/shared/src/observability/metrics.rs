//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集。
//! 命令行工具是一次性进程，因此只安装记录器，不启动 HTTP 端点；快照通过 `render` 输出。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源句柄
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// 渲染 Prometheus 文本格式快照
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 安装 Prometheus 记录器
///
/// 全局记录器只能安装一次，再次调用时复用已安装的 handle。
pub fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(MetricsHandle {
            handle: handle.clone(),
        });
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();

    register_common_metrics(&config.service_name);

    Ok(MetricsHandle { handle })
}

/// 注册通用指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("stage_runs_total", "Total number of pipeline stage runs");
    metrics::describe_histogram!(
        "stage_run_duration_seconds",
        "Pipeline stage run duration in seconds"
    );

    metrics::describe_counter!(
        "rule_applications_total",
        "Total number of rules applied to a table"
    );
    metrics::describe_counter!(
        "rule_row_failures_total",
        "Rows passed through unmodified because a rule failed on them"
    );

    metrics::describe_counter!(
        "expression_fallbacks_total",
        "Expressions that could not be evaluated and fell back to their source text"
    );

    metrics::describe_counter!(
        "validation_issues_total",
        "Data consistency issues found after financial calculation"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录流水线步骤执行
#[inline]
pub fn record_stage_run(stage: u8, status: &str, duration_secs: f64) {
    metrics::counter!(
        "stage_runs_total",
        "stage" => stage.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "stage_run_duration_seconds",
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

/// 记录规则应用
#[inline]
pub fn record_rule_application(kind: &str, failed_rows: usize) {
    metrics::counter!("rule_applications_total", "kind" => kind.to_string()).increment(1);

    if failed_rows > 0 {
        metrics::counter!("rule_row_failures_total", "kind" => kind.to_string())
            .increment(failed_rows as u64);
    }
}

/// 记录表达式回退
#[inline]
pub fn record_expression_fallback() {
    metrics::counter!("expression_fallbacks_total").increment(1);
}

/// 记录数据一致性问题
#[inline]
pub fn record_validation_issue(severity: &str) {
    metrics::counter!("validation_issues_total", "severity" => severity.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_stage_run(2, "success", 0.1);
        record_rule_application("batch_update", 0);
        record_rule_application("conditional_logic", 3);
        record_expression_fallback();
        record_validation_issue("warning");
    }
}
