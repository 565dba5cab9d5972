//! 代理组健康检查核心
//!
//! - [`clash_proxy::DelayCache`]：带有效期的节点延迟缓存
//! - [`testing::ProbeCoordinator`]：限并发、去重的代理组探测
//! - [`traffic`]：内核流量打包值解码
//! - [`loader::ConfigAutoLoader`]：挑选并重新加载配置

pub mod clash_proxy;
pub mod clock;
pub mod config;
pub mod error;
pub mod loader;
pub mod profile;
pub mod testing;
pub mod traffic;

pub use error::{LoaderError, LoaderResult};
