//!
//! # 分块下载模块
//! 单个 worker 负责把一个字节范围写进分块临时文件，
//! 文件已有的大小就是续传偏移
//!

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::download::chunk_range::ChunkRange;
use crate::download::controller::DownloadState;
use crate::download::error::DownloadError;
use crate::download::http::HttpClient;
use crate::download::limiter::Pacer;

pub struct ChunkWorker {
    client: HttpClient,
    state: Arc<Mutex<DownloadState>>,
    index: usize,
    range: ChunkRange,
    chunk_path: PathBuf,
    url: String,
    speed_limit: u64,
    pause_flag: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel_token: CancellationToken,
}

impl ChunkWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: HttpClient,
        state: Arc<Mutex<DownloadState>>,
        index: usize,
        range: ChunkRange,
        chunk_path: PathBuf,
        url: String,
        speed_limit: u64,
        pause_flag: Arc<AtomicBool>,
        resume_notify: Arc<Notify>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            client,
            state,
            index,
            range,
            chunk_path,
            url,
            speed_limit,
            pause_flag,
            resume_notify,
            cancel_token,
        }
    }

    pub async fn run(self) -> Result<(), DownloadError> {
        // 打开或创建分块文件，追加写入
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.chunk_path)
            .await?;
        let mut offset = file.metadata().await?.len();

        if offset >= self.range.len() {
            debug!("Chunk {} already complete, skipping", self.index);
            self.set_completed(self.range.len());
            return Ok(());
        }

        if offset > 0 {
            info!("Resuming chunk {} from byte {}", self.index, offset);
        }
        self.set_completed(offset);

        let request_range = self.range.with_offset(offset);
        let response = self.client.get(&self.url, Some(&request_range)).await?;

        // 源站忽略 Range 直接回 200 时，只有首块可以接受，从头重写
        if response.status() == StatusCode::OK {
            if self.index > 0 {
                return Err(DownloadError::BadStatus(response.status()));
            }
            if offset > 0 {
                file.set_len(0).await?;
                offset = 0;
                self.set_completed(0);
            }
        }

        let mut pacer = Pacer::new(self.speed_limit);
        let mut stream = response.bytes_stream();

        loop {
            self.wait_if_paused().await?;

            let bytes: Bytes = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => return Err(DownloadError::Transport(err)),
                    None => break,
                },
            };

            // 不越过本块的右边界写入
            let allowed = self.range.len() - offset;
            if allowed == 0 {
                break;
            }
            let take = (bytes.len() as u64).min(allowed) as usize;

            file.write_all(&bytes[..take]).await?;
            offset += take as u64;
            self.set_completed(offset);

            if let Some(delay) = pacer.record(take as u64) {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if (take as u64) < bytes.len() as u64 {
                break;
            }
        }

        file.flush().await?;
        debug!("Chunk {} finished at {} bytes", self.index, offset);

        Ok(())
    }

    /// 暂停是电平触发的标志，恢复靠事件唤醒。
    /// 先建好 notified 再查标志，避免错过唤醒。
    async fn wait_if_paused(&self) -> Result<(), DownloadError> {
        loop {
            let notified = self.resume_notify.notified();
            if !self.pause_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(DownloadError::Cancelled),
                _ = notified => {}
            }
        }
    }

    fn set_completed(&self, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.completed_bytes.get_mut(self.index) {
            *slot = bytes;
        }
    }
}
