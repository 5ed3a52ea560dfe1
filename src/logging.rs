// ==========================================
// 标本导入对账系统 - 日志初始化
// ==========================================
// 过滤器: RUST_LOG，缺省 info
// 输出: 文本（终端）/ JSON（采集）/ 测试 writer
// ==========================================

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";
const TEST_FILTER: &str = "debug,rusqlite=info";

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// 按格式安装全局 subscriber
///
/// 进程内只能调用一次；重复调用会 panic（tracing 全局默认只可设置一次）。
///
/// # 示例
/// ```no_run
/// use specimen_sync::logging::{self, LogFormat};
/// logging::init_with(LogFormat::Json);
/// ```
pub fn init_with(format: LogFormat) {
    let builder = fmt().with_env_filter(env_filter(DEFAULT_FILTER)).with_target(true);
    match format {
        LogFormat::Text => builder.with_line_number(true).init(),
        LogFormat::Json => builder.json().with_current_span(true).init(),
    }
}

/// 文本格式（RUST_LOG=specimen_sync=trace 可查看逐阶段 SQL 计时）
pub fn init() {
    init_with(LogFormat::Text);
}

pub fn init_json() {
    init_with(LogFormat::Json);
}

/// 测试用: 输出交给 libtest 捕获，可重复调用
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(env_filter(TEST_FILTER))
        .with_test_writer()
        .try_init();
}
