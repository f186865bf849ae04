use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use vigil_gb28181::sip::RtpPortAllocator;
use vigil_gb28181::Result;

/// RTP 端口租约：记录每个流的归属设备，设备离线时整体回收
pub struct PortLeases {
    allocator: Arc<dyn RtpPortAllocator>,
    owners: RwLock<HashMap<String, String>>,
}

impl PortLeases {
    pub fn new(allocator: Arc<dyn RtpPortAllocator>) -> Self {
        Self {
            allocator,
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// 为设备的流分配端口
    pub async fn acquire(&self, device_id: &str, stream_id: &str) -> Result<u16> {
        let port = self.allocator.allocate(stream_id).await?;
        self.owners
            .write()
            .await
            .insert(stream_id.to_string(), device_id.to_string());
        Ok(port)
    }

    /// 归还单个流的端口
    pub async fn release(&self, stream_id: &str) {
        if self.owners.write().await.remove(stream_id).is_some() {
            self.allocator.release(stream_id).await;
        }
    }

    /// 归还设备名下全部端口，返回回收数量
    pub async fn release_device(&self, device_id: &str) -> usize {
        let streams: Vec<String> = {
            let mut owners = self.owners.write().await;
            let streams: Vec<String> = owners
                .iter()
                .filter(|(_, owner)| owner.as_str() == device_id)
                .map(|(stream_id, _)| stream_id.clone())
                .collect();
            for stream_id in &streams {
                owners.remove(stream_id);
            }
            streams
        };

        for stream_id in &streams {
            self.allocator.release(stream_id).await;
        }
        streams.len()
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.len()
    }
}
