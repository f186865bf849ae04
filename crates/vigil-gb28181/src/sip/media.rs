// RTP 收流端口分配
// 点播时由上层（媒体服务）为 stream_id 分配接收端口，BYE 后归还

use crate::{Gb28181Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// RTP 端口分配器
#[async_trait]
pub trait RtpPortAllocator: Send + Sync {
    /// 为流分配端口；同一 stream_id 重复分配返回同一端口
    async fn allocate(&self, stream_id: &str) -> Result<u16>;

    /// 归还端口
    async fn release(&self, stream_id: &str);
}

#[derive(Debug, Default)]
struct AllocState {
    by_stream: HashMap<String, u16>,
    in_use: HashSet<u16>,
    cursor: u32,
}

/// 进程内端口池（只分配偶数端口，奇数端口留给 RTCP）
#[derive(Debug)]
pub struct PortRangeAllocator {
    start: u16,
    end: u16,
    state: Mutex<AllocState>,
}

impl PortRangeAllocator {
    /// 端口区间 [start, end]；65535 无法取偶，此时端口池为空
    pub fn new(start: u16, end: u16) -> Self {
        let start = start.saturating_add(start % 2);
        Self {
            start,
            end,
            state: Mutex::new(AllocState {
                cursor: u32::from(start),
                ..Default::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        if self.end < self.start || self.start % 2 == 1 {
            0
        } else {
            usize::from((self.end - self.start) / 2 + 1)
        }
    }

    pub async fn in_use(&self) -> usize {
        self.state.lock().await.in_use.len()
    }
}

#[async_trait]
impl RtpPortAllocator for PortRangeAllocator {
    async fn allocate(&self, stream_id: &str) -> Result<u16> {
        let mut state = self.state.lock().await;
        if let Some(port) = state.by_stream.get(stream_id) {
            return Ok(*port);
        }

        let capacity = self.capacity();
        let (start, end) = (u32::from(self.start), u32::from(self.end));
        let mut cursor = state.cursor;
        for _ in 0..capacity {
            if cursor > end || cursor < start {
                cursor = start;
            }
            if let Ok(port) = u16::try_from(cursor) {
                if !state.in_use.contains(&port) {
                    state.in_use.insert(port);
                    state.by_stream.insert(stream_id.to_string(), port);
                    state.cursor = cursor + 2;
                    tracing::debug!(target: "gb28181::sip", %stream_id, port, "RTP port allocated");
                    return Ok(port);
                }
            }
            cursor += 2;
        }

        Err(Gb28181Error::Other(format!(
            "RTP port range {}-{} exhausted",
            self.start, self.end
        )))
    }

    async fn release(&self, stream_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(port) = state.by_stream.remove(stream_id) {
            state.in_use.remove(&port);
            tracing::debug!(target: "gb28181::sip", %stream_id, port, "RTP port released");
        }
    }
}
