// GB28181 设备/通道注册表
// 设备表、通道表各自持有读写锁；需要同时加锁时固定顺序：设备表 → 通道表

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// 信令传输方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("UDP"),
            Transport::Tcp => f.write_str("TCP"),
        }
    }
}

/// GB28181 设备
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub device_id: String,

    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,

    /// 信令地址
    pub sip_ip: String,
    pub sip_port: u16,
    pub transport: Transport,

    pub status: DeviceStatus,
    pub register_time: DateTime<Utc>,
    pub last_keepalive: DateTime<Utc>,

    /// 过期时间（秒）
    pub expires: u32,

    /// 通道 ID 列表（通道本体在通道表中）
    pub channels: Vec<String>,
    pub channel_count: usize,
    pub online_channels: usize,
    pub ptz_supported: bool,
}

impl Device {
    fn new(
        device_id: &str,
        name: &str,
        ip: &str,
        port: u16,
        expires: u32,
        transport: Transport,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            sip_ip: ip.to_string(),
            sip_port: port,
            transport,
            status: DeviceStatus::Online,
            register_time: now,
            last_keepalive: now,
            expires,
            channels: Vec::new(),
            channel_count: 0,
            online_channels: 0,
            ptz_supported: false,
        }
    }

    /// `last_keepalive + expires < now` 即视为过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.last_keepalive + Duration::seconds(i64::from(self.expires)) < now
    }

    /// 设备信令地址
    pub fn sip_addr(&self) -> Option<SocketAddr> {
        let ip = self.sip_ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.sip_port))
    }
}

/// 设备通道（摄像头）
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    /// 通道 ID（平台内全局唯一）
    pub channel_id: String,

    /// 所属设备
    pub device_id: String,

    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub parent_id: String,
    pub address: String,

    /// 通道状态（ON/OFF）
    pub status: String,

    /// 云台类型：0 未知，1 球机，2 半球，3 固定枪机，4 遥控枪机
    pub ptz_type: u8,
    pub ptz_supported: bool,

    pub longitude: String,
    pub latitude: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            device_id: String::new(),
            name: name.into(),
            manufacturer: String::new(),
            model: String::new(),
            parent_id: String::new(),
            address: String::new(),
            status: "ON".to_string(),
            ptz_type: 0,
            ptz_supported: false,
            longitude: String::new(),
            latitude: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("ON") || self.status.eq_ignore_ascii_case("online")
    }
}

/// 球机与遥控枪机支持云台控制
pub fn ptz_supported(ptz_type: u8) -> bool {
    matches!(ptz_type, 1 | 4)
}

/// DeviceInfo 应答中携带的设备描述（空值不覆盖）
#[derive(Debug, Clone, Default)]
pub struct DeviceInfoUpdate {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
}

/// 注册表统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub ptz_devices: usize,
    pub total_channels: usize,
    pub online_channels: usize,
}

/// 注册表事件观察者（构造时注入）
pub trait RegistryObserver: Send + Sync {
    /// 新通道入表（锁已释放后调用）
    fn on_channel_added(&self, channel: &Channel);

    fn on_device_removed(&self, _device_id: &str) {}
}

/// 设备/通道注册表
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    channels: RwLock<HashMap<String, Channel>>,
    observer: Option<Arc<dyn RegistryObserver>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Arc<dyn RegistryObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    /// 注册或刷新设备；返回是否为新设备
    pub async fn register(
        &self,
        device_id: &str,
        name: &str,
        ip: &str,
        port: u16,
        expires: u32,
        transport: Transport,
    ) -> bool {
        let now = Utc::now();
        let inserted = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(device_id) {
                Some(device) => {
                    device.sip_ip = ip.to_string();
                    device.sip_port = port;
                    device.transport = transport;
                    device.register_time = now;
                    device.last_keepalive = now;
                    device.expires = expires;
                    device.status = DeviceStatus::Online;
                    if !name.is_empty() {
                        device.name = name.to_string();
                    }
                    false
                }
                None => {
                    devices.insert(
                        device_id.to_string(),
                        Device::new(device_id, name, ip, port, expires, transport, now),
                    );
                    true
                }
            }
        };

        tracing::info!(
            target: "gb28181::sip",
            %device_id,
            sip_addr = %format!("{}:{}", ip, port),
            %transport,
            expires,
            new = inserted,
            "Device registered",
        );
        inserted
    }

    /// 更新设备心跳
    pub async fn update_keepalive(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(device) => {
                device.last_keepalive = Utc::now();
                device.status = DeviceStatus::Online;
                true
            }
            None => false,
        }
    }

    /// 更新设备描述信息
    pub async fn update_device_info(&self, device_id: &str, info: DeviceInfoUpdate) -> bool {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };

        if !info.name.is_empty() {
            device.name = info.name;
        }
        if !info.manufacturer.is_empty() {
            device.manufacturer = info.manufacturer;
        }
        if !info.model.is_empty() {
            device.model = info.model;
        }
        if !info.firmware.is_empty() {
            device.firmware = info.firmware;
        }
        true
    }

    /// 新增或更新通道；返回是否为新通道。设备不存在时忽略。
    pub async fn add_or_update_channel(&self, device_id: &str, mut channel: Channel) -> bool {
        let now = Utc::now();
        channel.device_id = device_id.to_string();
        channel.ptz_supported = ptz_supported(channel.ptz_type);
        let channel_id = channel.channel_id.clone();

        let (inserted, snapshot) = {
            let mut devices = self.devices.write().await;
            let mut channels = self.channels.write().await;

            if !devices.contains_key(device_id) {
                tracing::warn!(
                    target: "gb28181::sip",
                    %device_id,
                    %channel_id,
                    "Channel reported by unknown device, ignored",
                );
                return false;
            }

            let (inserted, previous_owner) = match channels.get_mut(&channel_id) {
                Some(existing) => {
                    let previous_owner = (existing.device_id != device_id)
                        .then(|| existing.device_id.clone());
                    channel.created_at = existing.created_at;
                    channel.updated_at = now;
                    *existing = channel;
                    (false, previous_owner)
                }
                None => {
                    channel.created_at = now;
                    channel.updated_at = now;
                    channels.insert(channel_id.clone(), channel);
                    (true, None)
                }
            };

            // 通道换了归属设备时，从旧设备的列表中摘除
            if let Some(old_id) = previous_owner {
                if let Some(old) = devices.get_mut(&old_id) {
                    old.channels.retain(|id| *id != channel_id);
                    refresh_channel_counts(old, &channels);
                }
            }

            if let Some(device) = devices.get_mut(device_id) {
                if !device.channels.contains(&channel_id) {
                    device.channels.push(channel_id.clone());
                }
                refresh_channel_counts(device, &channels);
                device.ptz_supported |= channels
                    .get(&channel_id)
                    .map(|c| c.ptz_supported)
                    .unwrap_or(false);
            }

            (inserted, channels.get(&channel_id).cloned())
        };

        if inserted {
            tracing::debug!(
                target: "gb28181::sip",
                %device_id,
                %channel_id,
                "Added channel",
            );
            if let (Some(observer), Some(channel)) = (&self.observer, snapshot.as_ref()) {
                observer.on_channel_added(channel);
            }
        }
        inserted
    }

    /// 删除设备并级联删除其通道
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let removed = {
            let mut devices = self.devices.write().await;
            let mut channels = self.channels.write().await;
            remove_with_channels(&mut devices, &mut channels, device_id)
        };

        if removed {
            tracing::info!(target: "gb28181::sip", %device_id, "Device removed");
            if let Some(observer) = &self.observer {
                observer.on_device_removed(device_id);
            }
        }
        removed
    }

    /// 清理过期设备，返回被删除的设备 ID
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired = {
            let mut devices = self.devices.write().await;
            let mut channels = self.channels.write().await;

            let expired: Vec<String> = devices
                .values()
                .filter(|d| d.is_expired(now))
                .map(|d| d.device_id.clone())
                .collect();
            for device_id in &expired {
                remove_with_channels(&mut devices, &mut channels, device_id);
            }
            expired
        };

        if let Some(observer) = &self.observer {
            for device_id in &expired {
                observer.on_device_removed(device_id);
            }
        }
        expired
    }

    /// 心跳超时但注册仍有效的设备标记为离线，返回本次新标记的设备 ID
    pub async fn mark_offline(
        &self,
        now: DateTime<Utc>,
        heartbeat_timeout: std::time::Duration,
    ) -> Vec<String> {
        let Ok(timeout) = Duration::from_std(heartbeat_timeout) else {
            return Vec::new();
        };
        let mut devices = self.devices.write().await;
        let mut marked: Vec<String> = devices
            .values_mut()
            .filter(|d| d.status == DeviceStatus::Online)
            .filter(|d| d.last_keepalive.checked_add_signed(timeout).map_or(false, |t| t < now))
            .map(|d| {
                d.status = DeviceStatus::Offline;
                d.device_id.clone()
            })
            .collect();
        marked.sort();
        marked
    }

    /// 获取设备
    pub async fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// 列出所有设备（按 ID 排序）
    pub async fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// 列出设备下的通道（按 ID 排序）
    pub async fn list_channels(&self, device_id: &str) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    /// 统计信息
    pub async fn statistics(&self) -> RegistryStats {
        let devices = self.devices.read().await;
        let channels = self.channels.read().await;

        let online_devices = devices
            .values()
            .filter(|d| d.status == DeviceStatus::Online)
            .count();
        RegistryStats {
            total_devices: devices.len(),
            online_devices,
            offline_devices: devices.len() - online_devices,
            ptz_devices: devices.values().filter(|d| d.ptz_supported).count(),
            total_channels: channels.len(),
            online_channels: channels.values().filter(|c| c.is_online()).count(),
        }
    }
}

fn refresh_channel_counts(device: &mut Device, channels: &HashMap<String, Channel>) {
    device.channel_count = device.channels.len();
    device.online_channels = device
        .channels
        .iter()
        .filter_map(|id| channels.get(id))
        .filter(|c| c.is_online())
        .count();
}

fn remove_with_channels(
    devices: &mut HashMap<String, Device>,
    channels: &mut HashMap<String, Channel>,
    device_id: &str,
) -> bool {
    let Some(device) = devices.remove(device_id) else {
        return false;
    };
    for channel_id in &device.channels {
        channels.remove(channel_id);
    }
    channels.retain(|_, c| c.device_id != device_id);
    true
}
