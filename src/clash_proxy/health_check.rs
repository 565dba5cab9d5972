//! 代理节点健康检查
//! 通过 reqwest 经代理请求测试 URL，测量每个节点的延迟

use anyhow::{Result, anyhow};
use log::debug;
use std::time::{Duration, Instant};

use super::types::ProxyNodeInfo;

/// 默认测试地址
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// 代理健康检查器
#[derive(Debug, Clone)]
pub struct ProxyHealthChecker {
    /// 测试超时时间（毫秒）
    timeout_ms: u64,
    /// 测试目标 URL
    test_url: String,
}

impl ProxyHealthChecker {
    /// 创建新的健康检查器
    pub fn new(timeout_ms: u64, test_url: Option<String>) -> Self {
        Self {
            timeout_ms,
            test_url: test_url.unwrap_or_else(|| DEFAULT_TEST_URL.to_string()),
        }
    }

    /// 检查单个代理节点，返回延迟毫秒数
    pub async fn check_proxy_health(&self, proxy_info: &ProxyNodeInfo) -> Result<i64> {
        let proxy_url = self.build_proxy_url(proxy_info)?;

        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| anyhow!("Failed to create proxy: {}", e))?;

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
            .map_err(|e| anyhow!("Failed to create proxied HTTP client: {}", e))?;

        // 发送测试请求并测量延迟
        let start = Instant::now();
        let response = client.get(&self.test_url).send().await;
        let elapsed = start.elapsed();

        match response {
            Ok(resp) if resp.status().is_success() => {
                // 不足 1ms 也算一次有效测量
                Ok((elapsed.as_millis() as i64).max(1))
            }
            Ok(resp) => Err(anyhow!(
                "Test request failed with status: {}",
                resp.status()
            )),
            Err(e) => Err(anyhow!("Test request failed: {}", e)),
        }
    }

    /// 构建代理 URL，仅支持 reqwest 能直接使用的协议
    pub fn build_proxy_url(&self, proxy_info: &ProxyNodeInfo) -> Result<String> {
        let proto = proxy_info.proto.to_lowercase();

        match proto.as_str() {
            "http" | "https" | "socks5" | "socks5h" => {
                let credentials = proxy_info.extra_info.as_ref().and_then(|extra| {
                    let username = extra.get("username").and_then(|v| v.as_str())?;
                    let password = extra.get("password").and_then(|v| v.as_str())?;
                    Some((username.to_string(), password.to_string()))
                });

                let url = match credentials {
                    Some((username, password)) => format!(
                        "{}://{}:{}@{}:{}",
                        proto, username, password, proxy_info.server, proxy_info.port
                    ),
                    None => format!("{}://{}:{}", proto, proxy_info.server, proxy_info.port),
                };
                Ok(url)
            }
            _ => Err(anyhow!("不支持的代理协议: {}", proxy_info.proto)),
        }
    }

    /// 并发检查一批节点，返回 (节点名, 延迟)，失败的节点延迟为 0
    pub async fn check_proxies_health(&self, proxies: &[ProxyNodeInfo]) -> Vec<(String, i64)> {
        let mut tasks = Vec::new();

        for proxy in proxies {
            let proxy_clone = proxy.clone();
            let checker_clone = self.clone();

            let task = tokio::spawn(async move {
                match checker_clone.check_proxy_health(&proxy_clone).await {
                    Ok(delay_ms) => (proxy_clone.name, delay_ms),
                    Err(e) => {
                        debug!("节点 {} 检测失败: {}", proxy_clone.name, e);
                        (proxy_clone.name, 0)
                    }
                }
            });

            tasks.push((proxy.name.clone(), task));
        }

        // 等待所有任务完成并收集结果
        let mut results = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    debug!("节点 {} 检测任务异常: {}", name, e);
                    results.push((name, 0));
                }
            }
        }

        results
    }

    /// 获取测试超时时间
    pub fn get_timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// 获取测试 URL
    pub fn get_test_url(&self) -> &str {
        &self.test_url
    }
}
