pub mod aggresult;
pub mod cfg;
pub mod connection;
pub mod context;
pub mod db_error;
pub mod execution;
pub mod relation;
pub mod scramble;
pub mod sql;
pub mod types;

pub use context::AqpContext;

use tracing_subscriber::EnvFilter;

/// 安装日志，`RUST_LOG` 未设置时默认 info
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
