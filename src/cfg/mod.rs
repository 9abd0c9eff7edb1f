mod config;
mod watcher;

use std::sync::{Arc, RwLock};

pub use config::{get_config_path, Config, ConfigBuilder, ConfigWrapper, ScrambleOptions};
pub use watcher::watch_config;

/// 会话内共享的配置，配置文件变化时由 watcher 整体替换
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn load_config() -> crate::db_error::Result<Config> {
    Config::load_config()
}
