//! 测试辅助

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// 测试日志：当前 crate 打开 debug，输出交给测试框架捕获
pub fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        let filter_layer = EnvFilter::new("info,chat_sync_core=debug,sqlx=warn");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true) // 包含文件名
            .with_line_number(true) // 包含行号
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}
