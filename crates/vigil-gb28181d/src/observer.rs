use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use vigil_gb28181::sip::{Channel, RegistryObserver};

/// 注册表观察者：统计新发现的通道，并把离线设备转交给端口回收任务
pub struct DiscoveryObserver {
    discovered: AtomicU64,
    removed_tx: mpsc::UnboundedSender<String>,
}

impl DiscoveryObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                discovered: AtomicU64::new(0),
                removed_tx: tx,
            },
            rx,
        )
    }

    /// 启动以来发现的通道数
    pub fn discovered_channels(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }
}

impl RegistryObserver for DiscoveryObserver {
    fn on_channel_added(&self, channel: &Channel) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "gb28181d",
            device_id = %channel.device_id,
            channel_id = %channel.channel_id,
            name = %channel.name,
            ptz = channel.ptz_supported,
            "Channel discovered",
        );
    }

    fn on_device_removed(&self, device_id: &str) {
        // 接收端已关闭说明进程正在退出
        let _ = self.removed_tx.send(device_id.to_string());
    }
}
