use std::sync::Arc;

pub mod chunk_range;
pub mod chunk_worker;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod limiter;
pub mod logger;
pub mod manager;
pub mod persistence;
pub mod queue;
pub mod util;

#[cfg(test)]
pub(crate) mod test_server;

use crate::download::config::Settings;
use crate::download::error::DownloadError;
use crate::download::manager::DownloadManager;

/// 组装一个带后台快照任务的管理器，需要在 tokio 运行时内调用
pub fn build_manager(settings: Settings) -> Result<Arc<DownloadManager>, DownloadError> {
    let manager = DownloadManager::new(settings)?;
    manager.spawn_autosave();
    manager.load();

    Ok(manager)
}
