//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 安装全局的 fmt 订阅器
///
/// `RUST_LOG` 优先于传入的默认级别；重复调用不会报错。
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!(
            "llm_bulk_translator={0},bulk_translate={0}",
            default_level
        )));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("日志订阅器已经初始化");
    }
}
