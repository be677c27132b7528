use reqwest::StatusCode;
use thiserror::Error;
use tokio::io;
use uuid::Uuid;

/// 下载中发生的错误
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Http request failed: {:?}", .0)]
    Transport(#[from] reqwest::Error),

    #[error("Bad response status: {0}")]
    BadStatus(StatusCode),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("IOError: {:?}", .0)]
    Io(#[from] io::Error),

    #[error("Planning failed: {0}")]
    Planning(String),
}

impl DownloadError {
    /// 只有网络错误和 5xx 响应值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transport(_) => true,
            DownloadError::BadStatus(code) => code.is_server_error(),
            _ => false,
        }
    }
}

/// 队列与管理器层面的操作错误
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Download {0} not found in queue")]
    DownloadNotFound(Uuid),

    #[error("Queue {0} not found")]
    QueueNotFound(Uuid),

    #[error("Cannot change paths while downloads are ongoing")]
    DownloadsOngoing,

    #[error("IOError: {:?}", .0)]
    Io(#[from] io::Error),
}

/// 下载结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEndCause {
    Finished,
    Canceled,
    DeadlineExceeded,
}
