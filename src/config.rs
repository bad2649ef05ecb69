use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub crawl: CrawlConfig,
    pub reconcile: ReconcileConfig,
    pub validation: ValidationConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// 关闭时只写 CSV, 不连数据库
    pub enabled: bool,
}

/// 爬取节奏 / 重试 / 挑战与重新登录的上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub max_retries_per_page: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_ceiling_ms: u64,
    /// 单次抓取超时, 计入该页的重试次数
    pub fetch_timeout_ms: u64,
    pub challenge_timeout_secs: u64,
    pub challenge_poll_ms: u64,
    pub reauth_max_attempts: u32,
    pub reauth_cooldown_secs: u64,
    /// 0 = 不限
    pub max_pages: u32,
    /// 末页未知时, 连续放弃这么多页即结束本轮
    pub max_consecutive_gave_up: u32,
    /// 第一轮之后额外的核对轮数
    pub verification_passes: u32,
    pub page_pause_min_ms: u64,
    pub page_pause_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub amount_tolerance: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub absolute_tolerance: BigDecimal,
    pub relative_tolerance: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub state_dir: PathBuf,
    /// 浏览器层导出的页面 JSON
    pub snapshot_dir: PathBuf,
    pub output_dir: PathBuf,
    /// 并行爬取的日期数
    pub date_workers: usize,
}

fn decimal(text: &str) -> BigDecimal {
    BigDecimal::from_str(text).unwrap_or_default()
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_retries_per_page: 5,
            backoff_base_ms: 2_000,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 120_000,
            fetch_timeout_ms: 45_000,
            challenge_timeout_secs: 120,
            challenge_poll_ms: 1_000,
            reauth_max_attempts: 3,
            reauth_cooldown_secs: 90,
            max_pages: 0,
            max_consecutive_gave_up: 3,
            verification_passes: 1,
            page_pause_min_ms: 250,
            page_pause_max_ms: 900,
        }
    }
}

impl CrawlConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn challenge_poll(&self) -> Duration {
        Duration::from_millis(self.challenge_poll_ms)
    }

    pub fn reauth_cooldown(&self) -> Duration {
        Duration::from_secs(self.reauth_cooldown_secs)
    }

    /// 总轮数 = 1 + 核对轮数
    pub fn total_passes(&self) -> u32 {
        1 + self.verification_passes
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: decimal("0.50"),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            absolute_tolerance: decimal("0.05"),
            relative_tolerance: decimal("0.001"),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("output/state"),
            snapshot_dir: PathBuf::from("output/pages"),
            output_dir: PathBuf::from("output"),
            date_workers: 2,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/check_extract".to_string()),
                max_connections: 10,
                enabled: false,
            },
            crawl: CrawlConfig::default(),
            reconcile: ReconcileConfig::default(),
            validation: ValidationConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载配置: 代码默认值 -> config/default.toml -> config/local.toml -> CHECKX__* 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from(dir: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name(&format!("{dir}/default")).required(false))
            .add_source(File::with_name(&format!("{dir}/local")).required(false))
            .add_source(
                Environment::with_prefix("CHECKX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
