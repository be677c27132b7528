//!
//! # 下载队列模块
//! 按并发上限和时间窗口放行成员，团体操作向下传播
//!

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::RwLock;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::download::controller::{DownloadController, Status};
use crate::download::error::{DownloadEndCause, QueueError};
use crate::download::persistence::QueueSnapshot;
use crate::download::util;

const DEFAULT_SPEED_LIMIT: u64 = 100 * 1024;

/// 队列策略，结构性修改走 RwLock
#[derive(Clone, Debug)]
pub struct QueuePolicy {
    pub name: String,
    pub speed_limit: u64,
    pub concurrent_limit: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub temp_path: PathBuf,
    pub save_path: PathBuf,
}

impl QueuePolicy {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            speed_limit: DEFAULT_SPEED_LIMIT,
            concurrent_limit: 1,
            start_time: None,
            end_time: None,
            temp_path: util::default_temp_path(),
            save_path: util::default_save_path(),
        }
    }
}

pub struct QueueController {
    pub id: Uuid,
    policy: RwLock<QueuePolicy>,
    // 插入顺序即调度顺序
    downloads: Mutex<Vec<Arc<DownloadController>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueController {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            policy: RwLock::new(QueuePolicy::new(name)),
            downloads: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn from_snapshot(snapshot: QueueSnapshot, downloads: Vec<Arc<DownloadController>>) -> Arc<Self> {
        Arc::new(Self {
            id: snapshot.id,
            policy: RwLock::new(QueuePolicy {
                name: snapshot.name,
                speed_limit: snapshot.speed_limit,
                concurrent_limit: snapshot.concurrent_limit.max(1),
                start_time: snapshot.start_time,
                end_time: snapshot.end_time,
                temp_path: snapshot.temp_path,
                save_path: snapshot.save_path,
            }),
            downloads: Mutex::new(downloads),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy.read().clone()
    }

    /// 零散更新策略，None 表示保持原值
    pub fn update_policy(
        &self,
        concurrent_limit: Option<usize>,
        speed_limit: Option<u64>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) {
        let mut policy = self.policy.write();
        if let Some(limit) = concurrent_limit {
            policy.concurrent_limit = limit.max(1);
        }
        if let Some(limit) = speed_limit {
            policy.speed_limit = limit;
        }
        if start_time.is_some() {
            policy.start_time = start_time;
        }
        if end_time.is_some() {
            policy.end_time = end_time;
        }
    }

    /// 更换临时/保存目录；有任务在下载时拒绝，不迁移已有分块
    pub async fn set_paths(&self, temp_path: PathBuf, save_path: PathBuf) -> Result<(), QueueError> {
        if self.ongoing_count().await > 0 {
            return Err(QueueError::DownloadsOngoing);
        }

        tokio::fs::create_dir_all(&temp_path).await?;
        tokio::fs::create_dir_all(&save_path).await?;

        let mut policy = self.policy.write();
        policy.temp_path = temp_path;
        policy.save_path = save_path;
        Ok(())
    }

    pub async fn add_download(&self, dc: Arc<DownloadController>) {
        dc.set_queue_id(self.id);
        let mut downloads = self.downloads.lock().await;
        downloads.push(dc);
    }

    pub async fn downloads(&self) -> Vec<Arc<DownloadController>> {
        self.downloads.lock().await.clone()
    }

    pub async fn find(&self, download_id: Uuid) -> Option<Arc<DownloadController>> {
        self.downloads
            .lock()
            .await
            .iter()
            .find(|dc| dc.id() == download_id)
            .cloned()
    }

    // 队列锁内不碰下载锁，先克隆成员表再看状态
    pub async fn ongoing_count(&self) -> usize {
        let downloads = self.downloads().await;
        downloads
            .iter()
            .filter(|dc| dc.status() == Status::Ongoing)
            .count()
    }

    /// Schedule every member that is not COMPLETED. Each member gets its own
    /// coordinator task; the semaphore enforces the concurrency ceiling.
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        let policy = self.policy();
        tokio::fs::create_dir_all(&policy.temp_path).await?;
        tokio::fs::create_dir_all(&policy.save_path).await?;

        let semaphore = Arc::new(Semaphore::new(policy.concurrent_limit));
        let members = self.downloads().await;

        info!(
            "Starting queue {} with {} members (limit {})",
            self.id,
            members.len(),
            policy.concurrent_limit
        );

        let mut handles = self.handles.lock().await;
        for dc in members {
            if dc.status() == Status::Completed {
                continue;
            }
            let queue = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                queue.run_member(dc, semaphore).await;
            }));
        }

        Ok(())
    }

    async fn run_member(self: Arc<Self>, dc: Arc<DownloadController>, semaphore: Arc<Semaphore>) {
        let scheduled_status = dc.status();

        // Admission slot; later members may overtake earlier ones here.
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };

        let policy = self.policy();

        // Honor the queue window before any network work.
        if let Some(start_time) = policy.start_time {
            let now = Utc::now();
            if start_time > now {
                let wait = (start_time - now).to_std().unwrap_or_default();
                info!("Download {} waits {:?} for the queue start time", dc.id(), wait);
                tokio::time::sleep(wait).await;
            }
        }
        if policy.end_time.is_some_and(|end| Utc::now() > end) {
            info!("Download {} skipped: past the queue end time", dc.id());
            return;
        }

        let current = dc.status();
        match current {
            // Alive or already done; nothing to admit.
            Status::Completed | Status::Ongoing | Status::Paused => return,
            Status::Failed | Status::Canceled => {
                // A member that reached a terminal state while waiting for
                // its slot is left alone; re-admission only applies to
                // members that were already terminal when scheduled.
                if current != scheduled_status {
                    return;
                }
                dc.reset_for_restart(&policy.temp_path).await;
            }
            Status::NotStarted => {}
        }

        // Inherit the queue speed limit when the member has none of its own.
        if dc.speed_limit() == 0 {
            dc.set_speed_limit(policy.speed_limit);
        }

        // Atomic NOT_STARTED -> ONGOING; a racing scheduler loses here.
        if !dc.try_admit() {
            return;
        }
        info!("Starting download {} in queue {}", dc.id(), self.id);

        match dc
            .start(&policy.temp_path, &policy.save_path, policy.end_time)
            .await
        {
            Ok(DownloadEndCause::Finished) => {}
            Ok(DownloadEndCause::Canceled) => {
                info!("Download {} left the queue canceled", dc.id())
            }
            Ok(DownloadEndCause::DeadlineExceeded) => {
                warn!("Download {} missed the queue end time", dc.id())
            }
            Err(err) => error!("Download {} failed: {err}", dc.id()),
        }
    }

    /// 立即启动指定成员，不占并发名额
    pub async fn start_download(self: &Arc<Self>, download_id: Uuid) -> Result<(), QueueError> {
        let policy = self.policy();
        tokio::fs::create_dir_all(&policy.temp_path).await?;
        tokio::fs::create_dir_all(&policy.save_path).await?;

        let dc = self
            .find(download_id)
            .await
            .ok_or(QueueError::DownloadNotFound(download_id))?;

        match dc.status() {
            Status::Ongoing | Status::Completed => return Ok(()),
            Status::Paused => {
                dc.resume();
                return Ok(());
            }
            Status::Failed | Status::Canceled => dc.reset_for_restart(&policy.temp_path).await,
            Status::NotStarted => {}
        }

        if dc.speed_limit() == 0 {
            dc.set_speed_limit(policy.speed_limit);
        }
        dc.set_queue_id(self.id);
        if !dc.try_admit() {
            return Ok(());
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(async move {
            if let Err(err) = dc
                .start(&policy.temp_path, &policy.save_path, policy.end_time)
                .await
            {
                error!("Download {} failed: {err}", dc.id());
            }
        }));

        Ok(())
    }

    /// 等待所有协调任务退出，给宿主和测试用
    pub async fn wait_for_completion(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().await;
                handles.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }
    }

    pub async fn pause_all(&self) {
        info!("Pausing all downloads in queue {}", self.id);
        for dc in self.downloads().await {
            dc.pause();
        }
    }

    pub async fn resume_all(&self) {
        info!("Resuming all downloads in queue {}", self.id);
        for dc in self.downloads().await {
            dc.resume();
        }
    }

    pub async fn cancel_all(&self) {
        info!("Cancelling all downloads in queue {}", self.id);
        let temp_path = self.policy.read().temp_path.clone();
        for dc in self.downloads().await {
            dc.cancel(&temp_path).await;
        }
    }

    pub async fn pause_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        let dc = self
            .find(download_id)
            .await
            .ok_or(QueueError::DownloadNotFound(download_id))?;
        dc.pause();
        Ok(())
    }

    pub async fn resume_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        let dc = self
            .find(download_id)
            .await
            .ok_or(QueueError::DownloadNotFound(download_id))?;
        dc.resume();
        Ok(())
    }

    pub async fn cancel_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        let dc = self
            .find(download_id)
            .await
            .ok_or(QueueError::DownloadNotFound(download_id))?;
        let temp_path = self.policy.read().temp_path.clone();
        dc.cancel(&temp_path).await;
        Ok(())
    }

    /// 移除前先取消，避免留下孤儿 worker
    pub async fn remove_download(&self, download_id: Uuid) -> Result<(), QueueError> {
        let dc = {
            let mut downloads = self.downloads.lock().await;
            let position = downloads
                .iter()
                .position(|dc| dc.id() == download_id)
                .ok_or(QueueError::DownloadNotFound(download_id))?;
            downloads.remove(position)
        };

        let temp_path = self.policy.read().temp_path.clone();
        dc.cancel(&temp_path).await;
        info!("Removed download {download_id} from queue {}", self.id);
        Ok(())
    }

    /// 构造持久化快照
    pub async fn snapshot(&self) -> QueueSnapshot {
        let policy = self.policy();
        let downloads = self
            .downloads()
            .await
            .iter()
            .map(|dc| dc.snapshot())
            .collect();

        QueueSnapshot {
            id: self.id,
            name: policy.name,
            speed_limit: policy.speed_limit,
            concurrent_limit: policy.concurrent_limit,
            start_time: policy.start_time,
            end_time: policy.end_time,
            temp_path: policy.temp_path,
            save_path: policy.save_path,
            downloads,
        }
    }
}
