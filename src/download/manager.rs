//!
//! # 下载管理器
//! 队列注册表和下载控制器工厂，持有全进程共享的 HTTP 客户端
//!

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use dashmap::DashMap;
use log::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::download::config::Settings;
use crate::download::controller::{DownloadController, DownloadState, Status};
use crate::download::error::{DownloadError, QueueError};
use crate::download::http::HttpClient;
use crate::download::persistence;
use crate::download::queue::QueueController;
use crate::download::util;

pub struct DownloadManager {
    queues: DashMap<Uuid, Arc<QueueController>>,
    client: HttpClient,
    settings: Settings,
    save_sender: Sender<()>,
    save_receiver: Receiver<()>,
}

impl DownloadManager {
    pub fn new(settings: Settings) -> Result<Arc<Self>, DownloadError> {
        let (save_sender, save_receiver) = async_channel::unbounded();

        Ok(Arc::new(Self {
            queues: DashMap::new(),
            client: HttpClient::new()?,
            settings,
            save_sender,
            save_receiver,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 后台快照任务：每收到一个保存信号就落盘一次
    pub fn spawn_autosave(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while manager.save_receiver.recv().await.is_ok() {
                if let Err(err) = manager.save().await {
                    warn!("Snapshot failed: {err}");
                }
            }
        });
    }

    // 无界通道上 try_send 不会阻塞，失败说明进程正在退出
    fn signal_save(&self) {
        let _ = self.save_sender.try_send(());
    }

    pub fn add_queue(&self, name: &str) -> Arc<QueueController> {
        let queue = QueueController::new(name);
        self.queues.insert(queue.id, queue.clone());
        info!("Created queue {name} ({})", queue.id);
        self.signal_save();

        queue
    }

    pub fn queue(&self, queue_id: Uuid) -> Option<Arc<QueueController>> {
        self.queues.get(&queue_id).map(|entry| entry.value().clone())
    }

    pub fn queues(&self) -> Vec<Arc<QueueController>> {
        self.queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn find_queue_by_name(&self, name: &str) -> Option<Arc<QueueController>> {
        self.queues
            .iter()
            .find(|entry| entry.value().policy().name == name)
            .map(|entry| entry.value().clone())
    }

    pub async fn remove_queue(&self, queue_id: Uuid) -> Result<(), QueueError> {
        let (_, queue) = self
            .queues
            .remove(&queue_id)
            .ok_or(QueueError::QueueNotFound(queue_id))?;
        queue.cancel_all().await;
        self.signal_save();

        Ok(())
    }

    /// 探测失败或长度非法时返回预先标记为 FAILED 的控制器，URL 保留在状态里
    pub async fn new_download(&self, url: &str) -> Arc<DownloadController> {
        let id = Uuid::new_v4();
        let file_name = Url::parse(url)
            .ok()
            .and_then(|parsed| util::extract_file_name(&parsed))
            .unwrap_or_else(|| format!("download-{id}"));

        let mut state = DownloadState {
            id,
            queue_id: Uuid::nil(),
            url: url.to_string(),
            status: Status::NotStarted,
            file_name,
            chunks: Vec::new(),
            completed_bytes: Vec::new(),
            total_size: 0,
            speed_limit: self.settings.speed_limit_bytes(),
        };

        // Range 支持未知时退回单块下载
        let mut single_chunk = false;
        match self.client.probe(url).await {
            Ok(probe) if probe.total_size > 0 => {
                state.total_size = probe.total_size;
                single_chunk = !probe.supports_range;
            }
            Ok(_) => {
                error!("Probe for {url} reported an empty file");
                state.status = Status::Failed;
            }
            Err(err) => {
                error!("Probe for {url} failed: {err}");
                state.status = Status::Failed;
            }
        }

        let controller = DownloadController::from_state(
            state,
            self.client.clone(),
            self.settings.tmp_file_prefix.clone(),
        );

        if controller.status() != Status::Failed {
            let workers_override = if single_chunk { 1 } else { self.settings.workers_num };
            if let Err(err) = controller.plan(workers_override) {
                error!("Planning for {url} failed: {err}");
                controller.set_status(Status::Failed);
            }
        }

        Arc::new(controller)
    }

    pub async fn add_download(
        &self,
        queue_id: Uuid,
        dc: Arc<DownloadController>,
    ) -> Result<(), QueueError> {
        let queue = self
            .queue(queue_id)
            .ok_or(QueueError::QueueNotFound(queue_id))?;
        queue.add_download(dc).await;
        self.signal_save();

        Ok(())
    }

    pub async fn start_queue(&self, queue_id: Uuid) -> Result<(), QueueError> {
        let queue = self
            .queue(queue_id)
            .ok_or(QueueError::QueueNotFound(queue_id))?;
        queue.start().await
    }

    /// 跨队列按下载 id 操作
    pub async fn pause_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        for queue in self.queues() {
            if queue.pause_download(download_id).await.is_ok() {
                return Ok(());
            }
        }
        Err(QueueError::DownloadNotFound(download_id))
    }

    pub async fn resume_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        for queue in self.queues() {
            if queue.resume_download(download_id).await.is_ok() {
                return Ok(());
            }
        }
        Err(QueueError::DownloadNotFound(download_id))
    }

    pub async fn cancel_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        for queue in self.queues() {
            if queue.cancel_download(download_id).await.is_ok() {
                return Ok(());
            }
        }
        Err(QueueError::DownloadNotFound(download_id))
    }

    pub async fn remove_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        for queue in self.queues() {
            if queue.remove_download(download_id).await.is_ok() {
                self.signal_save();
                return Ok(());
            }
        }
        Err(QueueError::DownloadNotFound(download_id))
    }

    /// 全量快照落盘
    pub async fn save(&self) -> Result<(), DownloadError> {
        let queues = self.queues();
        let mut snapshots = Vec::with_capacity(queues.len());
        for queue in queues {
            snapshots.push(queue.snapshot().await);
        }

        persistence::save_to_file(&self.settings.json_address, &snapshots)
    }

    /// 启动时恢复队列，运行期句柄全部重建
    pub fn load(&self) {
        let snapshots = persistence::load_from_file(&self.settings.json_address);
        for snapshot in snapshots {
            let downloads: Vec<_> = snapshot
                .downloads
                .iter()
                .map(|download| {
                    let mut state = download.clone();
                    // 重启后没有存活的 worker，回到可入队状态
                    if matches!(state.status, Status::Ongoing | Status::Paused) {
                        state.status = Status::NotStarted;
                    }
                    Arc::new(DownloadController::from_state(
                        state,
                        self.client.clone(),
                        self.settings.tmp_file_prefix.clone(),
                    ))
                })
                .collect();

            let members = downloads.len();
            let queue = QueueController::from_snapshot(snapshot, downloads);
            info!("Restored queue {} with {members} members", queue.id);
            self.queues.insert(queue.id, queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::chunk_range::ChunkRange;
    use crate::download::test_server::{self, Origin};

    fn settings_in(dir: &tempfile::TempDir) -> Settings {
        Settings {
            json_address: dir
                .path()
                .join("queues.json")
                .to_str()
                .unwrap()
                .to_string(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn failed_probe_premarks_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(settings_in(&dir)).unwrap();

        let url = "http://127.0.0.1:9/missing.bin";
        let dc = manager.new_download(url).await;
        let state = dc.snapshot();

        assert_eq!(state.status, Status::Failed);
        assert_eq!(state.url, url);
        assert_eq!(state.file_name, "missing.bin");
        assert!(state.chunks.is_empty());
    }

    #[tokio::test]
    async fn file_name_falls_back_to_download_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(settings_in(&dir)).unwrap();

        let dc = manager.new_download("http://127.0.0.1:9/").await;
        let state = dc.snapshot();
        assert_eq!(state.file_name, format!("download-{}", state.id));
    }

    #[tokio::test]
    async fn new_download_plans_single_chunk_for_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(settings_in(&dir)).unwrap();
        let url = test_server::spawn(Origin::new(test_server::pattern_bytes(512))).await;

        let dc = manager.new_download(&url).await;
        let state = dc.snapshot();

        assert_eq!(state.status, Status::NotStarted);
        assert_eq!(state.total_size, 512);
        assert_eq!(state.chunks, vec![ChunkRange::new(0, 511)]);
        assert_eq!(state.completed_bytes, vec![0]);
        assert_eq!(state.file_name, "file");
    }

    #[tokio::test]
    async fn workers_num_overrides_planning() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(&dir);
        settings.workers_num = 3;
        let manager = DownloadManager::new(settings).unwrap();
        let url = test_server::spawn(Origin::new(test_server::pattern_bytes(3000))).await;

        let dc = manager.new_download(&url).await;
        let chunks = dc.snapshot().chunks;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 2999);
    }

    #[tokio::test]
    async fn add_download_requires_existing_queue() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(settings_in(&dir)).unwrap();
        let dc = manager.new_download("http://127.0.0.1:9/x").await;

        let ghost = Uuid::new_v4();
        assert!(matches!(
            manager.add_download(ghost, dc).await,
            Err(QueueError::QueueNotFound(id)) if id == ghost
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_run_and_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);
        let body = test_server::pattern_bytes(512);
        let url = test_server::spawn(Origin::new(body.clone())).await;

        let manager = DownloadManager::new(settings.clone()).unwrap();
        let queue = manager.add_queue("main");
        queue
            .set_paths(dir.path().join("tmp"), dir.path().join("save"))
            .await
            .unwrap();

        let dc = manager.new_download(&url).await;
        manager.add_download(queue.id, dc.clone()).await.unwrap();
        manager.start_queue(queue.id).await.unwrap();
        queue.wait_for_completion().await;

        assert_eq!(dc.status(), Status::Completed);
        let saved = std::fs::read(dir.path().join("save").join("file")).unwrap();
        assert_eq!(saved, body);

        manager.save().await.unwrap();

        // 重启：新管理器从同一份 queues.json 恢复
        let restored_manager = DownloadManager::new(settings).unwrap();
        restored_manager.load();
        let restored = restored_manager.queue(queue.id).unwrap();

        let before = serde_json::to_value(queue.snapshot().await).unwrap();
        let after = serde_json::to_value(restored.snapshot().await).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn load_downgrades_live_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(&dir);

        let manager = DownloadManager::new(settings.clone()).unwrap();
        let queue = manager.add_queue("main");
        let dc = manager.new_download("http://127.0.0.1:9/a.bin").await;
        dc.set_status(Status::Ongoing);
        manager.add_download(queue.id, dc).await.unwrap();
        manager.save().await.unwrap();

        let restored_manager = DownloadManager::new(settings).unwrap();
        restored_manager.load();
        let restored = restored_manager.queue(queue.id).unwrap();
        let downloads = restored.downloads().await;
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].status(), Status::NotStarted);
    }
}
