//! Clash 代理节点与代理组信息结构体定义

use serde::{Deserialize, Serialize};

/// 代理节点信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyNodeInfo {
    /// 节点名称
    pub name: String,
    /// 协议类型
    pub proto: String,
    /// 服务器地址
    pub server: String,
    /// 端口号
    pub port: u16,
    /// 是否支持 UDP
    pub support_udp: bool,
    /// 延迟（毫秒），0 表示未检测或不可用
    pub delay_ms: i64,
    /// 额外信息（认证等）
    pub extra_info: Option<serde_json::Value>,
}

impl ProxyNodeInfo {
    /// 创建新的代理节点信息
    pub fn new(name: String, proto: String, server: String, port: u16) -> Self {
        Self {
            name,
            proto,
            server,
            port,
            support_udp: false,
            delay_ms: 0,
            extra_info: None,
        }
    }

    pub fn with_udp_support(mut self, support_udp: bool) -> Self {
        self.support_udp = support_udp;
        self
    }

    pub fn with_delay(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_extra_info(mut self, extra_info: serde_json::Value) -> Self {
        self.extra_info = Some(extra_info);
        self
    }

    /// 检查节点是否可用（延迟小于 5000ms）
    pub fn is_available(&self) -> bool {
        self.delay_ms > 0 && self.delay_ms < 5000
    }

    /// 获取延迟描述
    pub fn get_delay_description(&self) -> String {
        if self.delay_ms <= 0 {
            "未检测".to_string()
        } else if self.delay_ms < 100 {
            format!("{}ms (极快)", self.delay_ms)
        } else if self.delay_ms < 300 {
            format!("{}ms (快速)", self.delay_ms)
        } else if self.delay_ms < 1000 {
            format!("{}ms (一般)", self.delay_ms)
        } else {
            format!("{}ms (较慢)", self.delay_ms)
        }
    }
}

/// 代理组视图，节点延迟取自延迟缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGroupInfo {
    pub name: String,
    /// 组类型（select, url-test, fallback ...）
    pub group_type: String,
    pub proxies: Vec<ProxyNodeInfo>,
    /// 当前选中的节点
    pub now: String,
}
