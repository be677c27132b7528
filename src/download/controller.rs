//!
//! # 下载控制器模块
//! 一个控制器对应一次文件传输：切块、并发拉取、合并、清理，
//! 以及暂停/恢复/取消的状态流转
//!

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::download::chunk_range::{split_into_chunks, ChunkRange};
use crate::download::chunk_worker::ChunkWorker;
use crate::download::error::{DownloadEndCause, DownloadError};
use crate::download::http::HttpClient;
use crate::download::util;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    Ongoing,
    Paused,
    Completed,
    Failed,
    Canceled,
}

/// 可序列化的下载状态，运行期的信号句柄不在这里
#[derive(Deserialize, Serialize, Clone)]
pub struct DownloadState {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub url: String,
    pub status: Status,
    pub file_name: String,
    pub chunks: Vec<ChunkRange>,
    pub completed_bytes: Vec<u64>,
    pub total_size: u64,
    pub speed_limit: u64,
}

impl DownloadState {
    pub fn downloaded(&self) -> u64 {
        self.completed_bytes.iter().sum()
    }

    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.downloaded() as f64 / self.total_size as f64
        }
    }
}

pub struct DownloadController {
    // id 不可变，放锁外随时可读
    id: Uuid,
    // 多任务共享，改状态要先 lock，临界区内不 await
    pub state: Arc<Mutex<DownloadState>>,
    client: HttpClient,
    tmp_prefix: String,
    pause_flag: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel_token: Mutex<CancellationToken>,
}

impl DownloadController {
    pub fn from_state(mut state: DownloadState, client: HttpClient, tmp_prefix: String) -> Self {
        // 持久化数据里的进度向量可能过期，以分块数为准
        if state.completed_bytes.len() != state.chunks.len() {
            state.completed_bytes = vec![0; state.chunks.len()];
        }

        Self {
            id: state.id,
            state: Arc::new(Mutex::new(state)),
            client,
            tmp_prefix,
            pause_flag: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }

    pub fn queue_id(&self) -> Uuid {
        self.state.lock().queue_id
    }

    pub fn set_queue_id(&self, queue_id: Uuid) {
        self.state.lock().queue_id = queue_id;
    }

    pub fn speed_limit(&self) -> u64 {
        self.state.lock().speed_limit
    }

    pub fn set_speed_limit(&self, limit: u64) {
        self.state.lock().speed_limit = limit;
    }

    pub fn snapshot(&self) -> DownloadState {
        self.state.lock().clone()
    }

    /// NOT_STARTED → ONGOING 的原子流转，重复调度时只有一个赢家
    pub fn try_admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == Status::NotStarted {
            state.status = Status::Ongoing;
            true
        } else {
            false
        }
    }

    /// 幂等切块：已有分块直接返回，total_size 必须为正
    pub fn plan(&self, workers_override: u64) -> Result<(), DownloadError> {
        let mut state = self.state.lock();
        if !state.chunks.is_empty() {
            return Ok(());
        }
        if state.total_size == 0 {
            return Err(DownloadError::Planning(format!(
                "download {} has no positive total size",
                state.id
            )));
        }

        let workers = util::optimal_workers(state.total_size, workers_override);
        state.chunks = split_into_chunks(state.total_size, workers);
        state.completed_bytes = vec![0; state.chunks.len()];
        info!(
            "Planned download {} into {} chunks ({} bytes)",
            state.id,
            state.chunks.len(),
            state.total_size
        );

        Ok(())
    }

    pub fn chunk_path(&self, temp_path: &Path, index: usize) -> PathBuf {
        let file_name = self.state.lock().file_name.clone();
        temp_path.join(format!("{}-{}-{}.tmp", self.tmp_prefix, file_name, index))
    }

    /// 为每个分块起一个 worker 并等它们全部结束。
    /// 全部成功且未过截止时间时按序合并并清理临时文件。
    pub async fn start(
        &self,
        temp_path: &Path,
        save_path: &Path,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<DownloadEndCause, DownloadError> {
        let (id, url, speed_limit, chunks) = {
            let mut state = self.state.lock();
            if state.status == Status::Completed {
                return Ok(DownloadEndCause::Finished);
            }
            if state.chunks.is_empty() {
                return Err(DownloadError::Planning(format!(
                    "download {} has no partition",
                    state.id
                )));
            }
            state.status = Status::Ongoing;
            (
                state.id,
                state.url.clone(),
                state.speed_limit,
                state.chunks.clone(),
            )
        };

        // 每次启动换一个新 token，清掉历史暂停标志
        let token = {
            let mut guard = self.cancel_token.lock();
            *guard = CancellationToken::new();
            guard.clone()
        };
        self.pause_flag.store(false, Ordering::SeqCst);

        let mut workers = FuturesUnordered::new();
        for (index, range) in chunks.iter().enumerate() {
            let worker = ChunkWorker::new(
                self.client.clone(),
                self.state.clone(),
                index,
                *range,
                self.chunk_path(temp_path, index),
                url.clone(),
                speed_limit,
                self.pause_flag.clone(),
                self.resume_notify.clone(),
                token.clone(),
            );
            workers.push(async move { (index, worker.run().await) });
        }

        let mut first_error: Option<DownloadError> = None;
        let mut cancelled = false;
        while let Some((index, result)) = workers.next().await {
            match result {
                Ok(()) => {}
                Err(DownloadError::Cancelled) => {
                    cancelled = true;
                }
                Err(err) => {
                    error!("Chunk {index} of download {id} failed: {err}");
                    // 第一个出错的 worker 叫停其余兄弟
                    if first_error.is_none() {
                        token.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            self.set_status(Status::Failed);
            return Err(err);
        }
        if cancelled {
            info!("Download {id} stopped by cancellation");
            return Ok(DownloadEndCause::Canceled);
        }

        if deadline.is_some_and(|end| Utc::now() > end) {
            warn!("Download {id} finished its chunks past the end time, not merging");
            self.set_status(Status::Failed);
            return Ok(DownloadEndCause::DeadlineExceeded);
        }

        if let Err(err) = self.merge(temp_path, save_path).await {
            error!("Failed to merge chunks for download {id}: {err}");
            self.set_status(Status::Failed);
            return Err(err);
        }

        self.cleanup_chunk_files(temp_path).await;
        self.set_status(Status::Completed);
        info!("Download {id} completed");

        Ok(DownloadEndCause::Finished)
    }

    /// 按分块序号顺序把临时文件串接成最终产物
    async fn merge(&self, temp_path: &Path, save_path: &Path) -> Result<(), DownloadError> {
        let (file_name, chunk_count) = {
            let state = self.state.lock();
            (state.file_name.clone(), state.chunks.len())
        };

        let out_path = save_path.join(&file_name);
        let mut out = File::create(&out_path).await?;

        for index in 0..chunk_count {
            let chunk_path = self.chunk_path(temp_path, index);
            let mut chunk_file = File::open(&chunk_path).await?;
            tokio::io::copy(&mut chunk_file, &mut out).await?;
        }
        out.flush().await?;

        info!("Merged {chunk_count} chunks into {}", out_path.display());
        Ok(())
    }

    /// 只在 ONGOING 时生效，重复调用是空操作
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.status == Status::Ongoing {
            state.status = Status::Paused;
            self.pause_flag.store(true, Ordering::SeqCst);
            info!("Download {} has been paused", state.id);
        }
    }

    /// 只在 PAUSED 时生效，唤醒所有阻塞中的 worker
    pub fn resume(&self) {
        let id = {
            let mut state = self.state.lock();
            if state.status != Status::Paused {
                return;
            }
            state.status = Status::Ongoing;
            self.pause_flag.store(false, Ordering::SeqCst);
            state.id
        };
        self.resume_notify.notify_waiters();
        info!("Download {id} has been resumed");
    }

    /// 取消是终态：触发 token、唤醒暂停中的 worker、删除分块文件
    pub async fn cancel(&self, temp_path: &Path) {
        let id = {
            let mut state = self.state.lock();
            if !matches!(state.status, Status::Ongoing | Status::Paused) {
                return;
            }
            state.status = Status::Canceled;
            state.id
        };

        self.cancel_token.lock().cancel();
        self.pause_flag.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();

        self.cleanup_chunk_files(temp_path).await;
        info!("Download {id} has been canceled");
    }

    /// FAILED/CANCELED 重新入队前的选择性重置：
    /// 丢掉磁盘上的分块、清零进度、回到 NOT_STARTED
    pub async fn reset_for_restart(&self, temp_path: &Path) {
        self.cleanup_chunk_files(temp_path).await;
        let mut state = self.state.lock();
        for slot in state.completed_bytes.iter_mut() {
            *slot = 0;
        }
        state.status = Status::NotStarted;
    }

    /// 失败后按固定间隔重试，同一套分块；存活的分块文件让重试只补缺口
    pub async fn retry(
        &self,
        max_attempts: u32,
        temp_path: &Path,
        save_path: &Path,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<DownloadEndCause, DownloadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.start(temp_path, save_path, deadline).await {
                Ok(cause) => return Ok(cause),
                Err(err) if attempt >= max_attempts || !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        "Attempt {attempt}/{max_attempts} for download {} failed: {err}",
                        self.id()
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// 清理失败只记日志，不影响状态流转
    pub async fn cleanup_chunk_files(&self, temp_path: &Path) {
        let chunk_count = self.state.lock().chunks.len();
        for index in 0..chunk_count {
            let path = self.chunk_path(temp_path, index);
            if !path.exists() {
                continue;
            }
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove chunk file {}: {err}", path.display());
            }
        }
    }
}
