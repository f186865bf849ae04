// GB28181 SIP 服务器配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 判定离线前允许丢失的心跳数
const HEARTBEAT_MISSES: u64 = 3;

/// RTP 收流端口区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpPortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for RtpPortRange {
    fn default() -> Self {
        Self {
            start: 30000,
            end: 30500,
        }
    }
}

/// SIP 服务器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipServerConfig {
    /// 监听 IP（同时作为 Via/Contact 中的本机地址）
    pub sip_ip: String,

    pub sip_port: u16,

    /// SIP 域（国标编码前 10 位）
    pub realm: String,

    /// 平台编码（20 位）
    pub server_id: String,

    /// 注册密码；为空则不鉴权
    pub password: Option<String>,

    /// 设备心跳间隔（秒）；连续 3 个间隔无心跳的设备标记为离线，0 表示不检查
    pub heartbeat_interval: u64,

    /// 设备未携带 Expires 时的默认有效期（秒）
    pub register_expires: u32,

    /// 过期清理周期（秒）
    pub sweep_interval_secs: u64,

    /// 同时处理的报文上限
    pub max_concurrent_dispatch: usize,

    pub tcp_enabled: bool,

    pub tcp_connect_timeout_secs: u64,

    /// inviting 状态的有效期（秒），超过后允许重新点播
    pub invite_timeout_secs: u64,

    /// 新设备注册后自动查询 DeviceInfo 和 Catalog
    pub auto_query: bool,

    pub rtp_port_range: RtpPortRange,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            sip_ip: "0.0.0.0".to_string(),
            sip_port: 5060,
            realm: "3402000000".to_string(),
            server_id: "34020000002000000001".to_string(),
            password: None,
            heartbeat_interval: 30,
            register_expires: 3600,
            sweep_interval_secs: 10,
            max_concurrent_dispatch: 1024,
            tcp_enabled: true,
            tcp_connect_timeout_secs: 5,
            invite_timeout_secs: 10,
            auto_query: true,
            rtp_port_range: RtpPortRange::default(),
        }
    }
}

impl SipServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.sip_ip, self.sip_port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// 心跳超时：3 个心跳间隔
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_interval > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval.saturating_mul(HEARTBEAT_MISSES)))
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_connect_timeout_secs)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.len() != 20 || !self.server_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("server_id must be 20 digits, got {:?}", self.server_id));
        }
        if self.realm.is_empty() {
            return Err("realm must not be empty".to_string());
        }
        if self.max_concurrent_dispatch == 0 {
            return Err("max_concurrent_dispatch must be greater than 0".to_string());
        }
        // 起始端口向上取偶后仍需落在区间内
        let range = self.rtp_port_range;
        let even_start = u32::from(range.start) + u32::from(range.start % 2);
        if even_start > u32::from(range.end) {
            return Err(format!("invalid rtp_port_range {}-{}", range.start, range.end));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SipServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:5060");
        assert_eq!(config.register_expires, 3600);
        assert_eq!(config.max_concurrent_dispatch, 1024);
        assert!(config.password.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config = SipServerConfig {
            server_id: "123".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.server_id = "34020000002000000001".to_string();
        config.rtp_port_range = RtpPortRange { start: 40000, end: 30000 };
        assert!(config.validate().is_err());

        // 65535 取偶后越界
        config.rtp_port_range = RtpPortRange { start: 65535, end: 65535 };
        assert!(config.validate().is_err());
        config.rtp_port_range = RtpPortRange { start: 30001, end: 30001 };
        assert!(config.validate().is_err());
        config.rtp_port_range = RtpPortRange { start: 65534, end: 65535 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_timeout() {
        let mut config = SipServerConfig::default();
        assert_eq!(config.heartbeat_timeout(), Some(Duration::from_secs(90)));

        config.heartbeat_interval = 0;
        assert_eq!(config.heartbeat_timeout(), None);

        config.heartbeat_interval = u64::MAX;
        assert_eq!(config.heartbeat_timeout(), Some(Duration::from_secs(u64::MAX)));
    }
}
