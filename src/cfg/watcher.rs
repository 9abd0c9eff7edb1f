use std::path::PathBuf;

use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{Config, SharedConfig};

/// 监听配置文件变化，更新会话共享的配置实例
///
/// 收到 shutdown 信号或者事件通道关闭时任务退出。
pub fn watch_config(path: PathBuf, shared: SharedConfig, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        // watcher 必须在整个监听期间保持存活
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .and_then(|mut watcher| watcher.watch(&path, RecursiveMode::NonRecursive).map(|_| watcher));
        let _watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("无法监听配置文件 {:?}: {}", path, e);
                return;
            }
        };

        // 主监听循环
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                opt = rx.recv() => {
                    match opt {
                        Some(Ok(ev)) if ev.kind.is_modify() => {
                            info!("配置文件发生变化: {:?}", ev.paths);
                            match Config::load_from(&path) {
                                Ok(new_config) => match shared.write() {
                                    Ok(mut config) => {
                                        *config = new_config;
                                        info!("配置已更新");
                                    }
                                    Err(e) => error!("配置锁被污染: {}", e),
                                },
                                Err(e) => error!("重新加载配置失败: {}", e),
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => error!("监听错误: {:?}", e),
                        None => break,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    #[tokio::test]
    async fn test_watch_config_shutdown() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[config]\nworker_count = 2\n").unwrap();
        let shared: SharedConfig = Arc::new(RwLock::new(Config::default()));
        let (tx, rx) = broadcast::channel(1);
        let handle = watch_config(file.path().to_path_buf(), shared.clone(), rx);
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(shared.read().unwrap().worker_count, 4);
    }

    #[tokio::test]
    async fn test_watch_config_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[config]\nworker_count = 2\n").unwrap();
        let shared: SharedConfig = Arc::new(RwLock::new(Config::default()));
        let (tx, rx) = broadcast::channel(1);
        let handle = watch_config(path.clone(), shared.clone(), rx);

        // 监听注册之前的写入可能丢失，每轮都重写一次直到观察到新配置
        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            std::fs::write(&path, "[config]\nworker_count = 7\nola_partitions = 3\n").unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let config = shared.read().unwrap().clone();
            if config.worker_count == 7 && config.ola_partitions == 3 {
                reloaded = true;
                break;
            }
        }
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(reloaded);
    }
}
