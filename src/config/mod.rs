use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // 探测参数
    pub max_concurrent_tests: usize,
    pub timeout: u64,
    pub test_url: String,
    pub result_buffer: usize,

    // 延迟缓存
    pub delay_validity_minutes: u64,

    // 配置加载
    pub profiles_file: String,
    pub settle_delay_ms: u64,
    pub tun_mode: bool,

    // 日志配置
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tests: 5,
            timeout: 5000,
            test_url: "http://www.gstatic.com/generate_204".to_string(),
            result_buffer: 100,
            delay_validity_minutes: 30,
            profiles_file: "config/profiles.yaml".to_string(),
            settle_delay_ms: 1000,
            tun_mode: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn get_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn delay_validity(&self) -> Duration {
        Duration::from_secs(self.delay_validity_minutes * 60)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
