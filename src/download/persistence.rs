//!
//! # 持久化模块
//! 把全部队列和下载写成一份 queues.json，重启时恢复；
//! 读失败永远不是致命错误
//!

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::download::controller::DownloadState;
use crate::download::error::DownloadError;

#[derive(Serialize, Deserialize, Clone)]
pub struct QueueSnapshot {
    pub id: Uuid,
    pub name: String,
    pub speed_limit: u64,
    pub concurrent_limit: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub temp_path: PathBuf,
    pub save_path: PathBuf,
    pub downloads: Vec<DownloadState>,
}

/// 先写临时文件再原地改名，保证快照完整
pub fn save_to_file(file_path: &str, snapshots: &[QueueSnapshot]) -> Result<(), DownloadError> {
    if let Some(parent) = Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let data = serde_json::to_string_pretty(snapshots).map_err(std::io::Error::from)?;

    let staging = format!("{file_path}.tmp");
    fs::write(&staging, data)?;
    fs::rename(&staging, file_path)?;

    Ok(())
}

/// 文件缺失或损坏时给空集合，只记一条警告
pub fn load_from_file(file_path: &str) -> Vec<QueueSnapshot> {
    if !Path::new(file_path).exists() {
        return Vec::new();
    }

    let data = match fs::read_to_string(file_path) {
        Ok(data) => data,
        Err(err) => {
            warn!("Failed to read {file_path}: {err}, starting with no queues");
            return Vec::new();
        }
    };

    match serde_json::from_str(&data) {
        Ok(snapshots) => snapshots,
        Err(err) => {
            warn!("Failed to parse {file_path}: {err}, starting with no queues");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::chunk_range::split_into_chunks;
    use crate::download::controller::Status;

    fn sample_snapshot() -> QueueSnapshot {
        let chunks = split_into_chunks(3000, 3);
        QueueSnapshot {
            id: Uuid::new_v4(),
            name: String::from("main"),
            speed_limit: 100 * 1024,
            concurrent_limit: 2,
            start_time: None,
            end_time: Some(Utc::now()),
            temp_path: PathBuf::from("/tmp/idm"),
            save_path: PathBuf::from("/tmp/idm-out"),
            downloads: vec![DownloadState {
                id: Uuid::new_v4(),
                queue_id: Uuid::new_v4(),
                url: String::from("http://example.com/a.bin"),
                status: Status::Paused,
                file_name: String::from("a.bin"),
                completed_bytes: vec![1000, 500, 0],
                total_size: 3000,
                speed_limit: 0,
                chunks,
            }],
        }
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.json");
        let path = path.to_str().unwrap();

        let original = vec![sample_snapshot()];
        save_to_file(path, &original).unwrap();
        let restored = load_from_file(path);

        assert_eq!(
            serde_json::to_value(&original).unwrap(),
            serde_json::to_value(&restored).unwrap()
        );
    }

    #[test]
    fn missing_file_yields_empty_set() {
        assert!(load_from_file("/nonexistent/queues.json").is_empty());
    }

    #[test]
    fn malformed_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_from_file(path.to_str().unwrap()).is_empty());
    }

    #[test]
    fn save_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.json");
        let path = path.to_str().unwrap();

        save_to_file(path, &[sample_snapshot(), sample_snapshot()]).unwrap();
        save_to_file(path, &[sample_snapshot()]).unwrap();

        assert_eq!(load_from_file(path).len(), 1);
    }
}
