//!
//! 配置模块
//!

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    /// 启动时显示的欢迎语
    pub welcome_message: String,
    /// 分块并发数，0 表示按文件大小自动决定
    pub workers_num: u64,
    /// 分块临时文件的前缀
    pub tmp_file_prefix: String,
    /// 默认单任务限速，单位 KiB/s，0 表示不限速
    pub speed_limit_kb: u64,
    /// 持久化文件路径
    pub json_address: String,
    /// 可选的日志文件
    pub log_file: Option<String>,
}

impl Settings {
    /// 从 JSON 文件加载配置，文件不存在时使用默认值；
    /// 环境变量里的同名大写键覆盖文件内容
    pub fn load(file_path: &str) -> Result<Self> {
        let settings = if Path::new(file_path).exists() {
            let data = fs::read_to_string(file_path)?;
            serde_json::from_str(&data)?
        } else {
            Settings::default()
        };

        Ok(settings.apply_env())
    }

    fn apply_env(mut self) -> Self {
        if let Ok(value) = env::var("WELCOME_MESSAGE") {
            self.welcome_message = value;
        }
        if let Ok(value) = env::var("WORKERS_NUM") {
            if let Ok(parsed) = value.parse() {
                self.workers_num = parsed;
            }
        }
        if let Ok(value) = env::var("TMP_FILE_PREFIX") {
            self.tmp_file_prefix = value;
        }
        if let Ok(value) = env::var("SPEED_LIMIT_KB") {
            if let Ok(parsed) = value.parse() {
                self.speed_limit_kb = parsed;
            }
        }
        if let Ok(value) = env::var("JSON_ADDRESS") {
            self.json_address = value;
        }

        self
    }

    /// 换算成 bytes/s
    pub fn speed_limit_bytes(&self) -> u64 {
        self.speed_limit_kb * 1024
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            welcome_message: String::from("tech-idm"),
            workers_num: 0,
            tmp_file_prefix: String::from("idm"),
            speed_limit_kb: 0,
            json_address: String::from("queues.json"),
            log_file: None,
        }
    }
}
