use std::path::PathBuf;
use url::Url;

const MIB: u64 = 1024 * 1024;
const CHUNK_THRESHOLD: u64 = 10 * MIB;
const HUGE_FILE_THRESHOLD: u64 = 10 * 1024 * MIB;

/// 从 URL 路径的最后一段取文件名
pub fn extract_file_name(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;

    Some(segment.to_string())
}

/// 根据文件大小决定分块下载的并发数
///
/// override_workers 非零时直接生效；小于 10MiB 的文件只用单块，
/// 超过 10GiB 的文件允许并发数翻倍，每块不小于 1MiB。
pub fn optimal_workers(total_size: u64, override_workers: u64) -> u64 {
    if override_workers > 0 {
        return override_workers;
    }
    if total_size < CHUNK_THRESHOLD {
        return 1;
    }

    let cores = num_cpus::get() as u64;
    let mut workers = cores.min(total_size / CHUNK_THRESHOLD);
    if total_size > HUGE_FILE_THRESHOLD {
        workers = (cores * 2).min(total_size / CHUNK_THRESHOLD);
    }

    workers.clamp(1, total_size / MIB)
}

pub fn default_temp_path() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tmp")
}

pub fn default_save_path() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("download")
}
