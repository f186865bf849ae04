// 心跳过期清理
// 定时移除 last_keepalive + expires 已过的设备，连带其通道与媒体会话；
// 心跳超时的设备只标记离线

use super::registry::DeviceRegistry;
use super::session::SessionManager;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 执行一次清理，返回被移除的设备
pub async fn sweep_once(
    registry: &DeviceRegistry,
    sessions: &SessionManager,
    now: DateTime<Utc>,
    heartbeat_timeout: Option<Duration>,
) -> Vec<String> {
    let expired = registry.sweep_expired(now).await;

    if let Some(timeout) = heartbeat_timeout {
        let offline = registry.mark_offline(now, timeout).await;
        if !offline.is_empty() {
            tracing::warn!(
                target: "gb28181::sip",
                devices = ?offline,
                timeout_secs = timeout.as_secs(),
                "Devices missed heartbeats, marked offline",
            );
        }
    }

    if expired.is_empty() {
        return expired;
    }

    let dropped = sessions.drop_for_devices(&expired).await;
    tracing::info!(
        target: "gb28181::sip",
        devices = ?expired,
        sessions = dropped.len(),
        "Removed expired devices",
    );
    expired
}

/// 清理循环，收到关闭信号后退出
pub async fn run_sweeper(
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    period: Duration,
    heartbeat_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                sweep_once(&registry, &sessions, Utc::now(), heartbeat_timeout).await;
            }
        }
    }

    tracing::debug!(target: "gb28181::sip", "Heartbeat sweeper stopped");
}
