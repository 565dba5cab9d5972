//! 代理模块封装
//! 延迟缓存，以及基于 Clash 配置的探测与加载实现

mod cache;
mod health_check;
mod manager;
mod types;

pub use cache::{DEFAULT_PROBE_LABEL, DEFAULT_VALIDITY, DelayCache, LatencyRecord};
pub use health_check::{DEFAULT_TEST_URL, ProxyHealthChecker};
pub use manager::{ClashProxyManager, GLOBAL_GROUP};
pub use types::{ProxyGroupInfo, ProxyNodeInfo};
