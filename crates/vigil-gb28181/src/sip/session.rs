// GB28181 媒体会话管理
// 实时点播以 (设备, 通道) 为键，录像回放以流 ID 为键；同一键最多一个未结束的会话

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::record::TimeRange;
use super::sdp::SdpSession;

/// 会话状态：inviting → playing | failed，playing → stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Inviting,
    Playing,
    Failed,
    Stopped,
}

/// 会话类型，决定 SSRC 首位与 SDP 会话名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Play,
    Playback,
}

/// 点播/回放会话
#[derive(Debug, Clone, Serialize)]
pub struct MediaSession {
    pub device_id: String,
    pub channel_id: String,
    pub kind: SessionKind,

    /// 对话标识
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,

    pub stream_id: String,

    /// 本端收流地址
    pub rtp_port: u16,
    pub media_ip: String,

    /// 10 位 SSRC（十进制串），会话存续期间不变
    pub ssrc: String,

    /// 设备应答 SDP 中的 y= 值（仅记录合法的 10 位数字）
    pub answered_ssrc: Option<String>,

    /// 媒体传输方式
    pub transport: String,

    /// 回放时间段
    pub range: Option<TimeRange>,

    /// 对端信令地址（BYE 发往此处）
    pub remote_addr: SocketAddr,

    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// 创建会话所需参数
#[derive(Debug, Clone)]
pub struct NewSession {
    pub device_id: String,
    pub channel_id: String,
    pub rtp_port: u16,
    pub media_ip: String,
    pub remote_addr: SocketAddr,
    pub realm: String,
    pub local_ip: String,
}

/// reserve 的结果
#[derive(Debug, Clone)]
pub enum Reservation {
    /// 已有 playing 或仍在邀请中的会话
    Existing(MediaSession),
    /// 新建的 inviting 会话，调用方负责发送 INVITE
    Created(MediaSession),
}

impl Reservation {
    pub fn session(&self) -> &MediaSession {
        match self {
            Reservation::Existing(s) | Reservation::Created(s) => s,
        }
    }

    pub fn into_session(self) -> MediaSession {
        match self {
            Reservation::Existing(s) | Reservation::Created(s) => s,
        }
    }
}

type SessionKey = (String, String);

#[derive(Debug, Default)]
struct SessionTables {
    live: HashMap<SessionKey, MediaSession>,
    playback: HashMap<String, MediaSession>,
}

impl SessionTables {
    fn iter(&self) -> impl Iterator<Item = &MediaSession> {
        self.live.values().chain(self.playback.values())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut MediaSession> {
        self.live.values_mut().chain(self.playback.values_mut())
    }

    /// 在存活会话中取一个未被占用的 SSRC
    fn next_ssrc(&self, realm: &str, playback: bool, now: DateTime<Utc>) -> String {
        let live: HashSet<&str> = self.iter().map(|s| s.ssrc.as_str()).collect();
        let mut seq = now.timestamp_subsec_nanos() % 100_000;
        let mut ssrc = generate_ssrc(realm, playback, seq);
        for _ in 0..100_000 {
            if !live.contains(ssrc.as_str()) {
                break;
            }
            seq = (seq + 1) % 100_000;
            ssrc = generate_ssrc(realm, playback, seq);
        }
        ssrc
    }

    fn new_session(&self, request: NewSession, range: Option<TimeRange>) -> MediaSession {
        let now = Utc::now();
        let (kind, stream_id) = match &range {
            None => (
                SessionKind::Play,
                generate_stream_id(&request.device_id, &request.channel_id),
            ),
            Some(range) => (
                SessionKind::Playback,
                playback_stream_id(&request.device_id, &request.channel_id, range),
            ),
        };

        MediaSession {
            ssrc: self.next_ssrc(&request.realm, kind == SessionKind::Playback, now),
            call_id: generate_call_id(&request.local_ip),
            from_tag: generate_tag(),
            to_tag: String::new(),
            stream_id,
            device_id: request.device_id,
            channel_id: request.channel_id,
            kind,
            rtp_port: request.rtp_port,
            media_ip: request.media_ip,
            answered_ssrc: None,
            transport: "UDP".to_string(),
            range,
            remote_addr: request.remote_addr,
            state: SessionState::Inviting,
            created_at: now,
            started_at: None,
        }
    }
}

/// playing 会话或未超时的 inviting 会话可直接复用
fn reusable(existing: &MediaSession, invite_timeout: Duration) -> bool {
    let age = Utc::now()
        .signed_duration_since(existing.created_at)
        .to_std()
        .unwrap_or_default();
    match existing.state {
        SessionState::Playing => true,
        SessionState::Inviting => age < invite_timeout,
        SessionState::Failed | SessionState::Stopped => false,
    }
}

fn log_discarded(existing: &MediaSession) {
    tracing::debug!(
        target: "gb28181::sip",
        device_id = %existing.device_id,
        channel_id = %existing.channel_id,
        stream_id = %existing.stream_id,
        state = ?existing.state,
        "Discarding stale session",
    );
}

/// 媒体会话表
#[derive(Debug, Default)]
pub struct SessionManager {
    tables: RwLock<SessionTables>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 实时点播：在一次写锁内完成去重与创建
    pub async fn reserve(&self, request: NewSession, invite_timeout: Duration) -> Reservation {
        let key = (request.device_id.clone(), request.channel_id.clone());
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.live.get(&key) {
            if reusable(existing, invite_timeout) {
                return Reservation::Existing(existing.clone());
            }
            log_discarded(existing);
        }
        tables.live.remove(&key);

        let session = tables.new_session(request, None);
        tables.live.insert(key, session.clone());
        Reservation::Created(session)
    }

    /// 录像回放：同一通道同一起始时间的回放去重
    pub async fn reserve_playback(
        &self,
        request: NewSession,
        range: TimeRange,
        invite_timeout: Duration,
    ) -> Reservation {
        let stream_id = playback_stream_id(&request.device_id, &request.channel_id, &range);
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.playback.get(&stream_id) {
            if reusable(existing, invite_timeout) {
                return Reservation::Existing(existing.clone());
            }
            log_discarded(existing);
        }
        tables.playback.remove(&stream_id);

        let session = tables.new_session(request, Some(range));
        tables.playback.insert(stream_id, session.clone());
        Reservation::Created(session)
    }

    /// 处理 INVITE 的应答；返回匹配到的会话（已更新）
    pub async fn apply_invite_response(
        &self,
        call_id: &str,
        status_code: u16,
        to_tag: Option<&str>,
        body: &str,
    ) -> Option<MediaSession> {
        if status_code < 200 {
            return None;
        }

        let mut tables = self.tables.write().await;
        let session = tables.iter_mut().find(|s| s.call_id == call_id)?;

        if let Some(tag) = to_tag {
            session.to_tag = tag.to_string();
        }

        // 只有 inviting 会话发生状态迁移，重复的 2xx 不改变 playing 会话
        if session.state == SessionState::Inviting {
            if (200..300).contains(&status_code) {
                session.state = SessionState::Playing;
                session.started_at = Some(Utc::now());
                match SdpSession::parse(body).ssrc {
                    Some(answered) if is_valid_ssrc(&answered) => {
                        session.answered_ssrc = Some(answered);
                    }
                    Some(answered) => tracing::warn!(
                        target: "gb28181::sip",
                        %call_id,
                        %answered,
                        "Ignoring malformed SSRC in INVITE answer",
                    ),
                    None => {}
                }
            } else {
                session.state = SessionState::Failed;
            }
        }
        Some(session.clone())
    }

    /// 标记会话失败（INVITE 未能发出）
    pub async fn mark_failed(&self, call_id: &str) -> bool {
        let mut tables = self.tables.write().await;
        let found = match tables.iter_mut().find(|s| s.call_id == call_id) {
            Some(session) => {
                session.state = SessionState::Failed;
                true
            }
            None => false,
        };
        found
    }

    /// 移除实时点播会话，返回的副本状态为 stopped
    pub async fn remove(&self, device_id: &str, channel_id: &str) -> Option<MediaSession> {
        let mut tables = self.tables.write().await;
        let mut session = tables
            .live
            .remove(&(device_id.to_string(), channel_id.to_string()))?;
        session.state = SessionState::Stopped;
        Some(session)
    }

    /// 按流 ID 移除回放会话
    pub async fn remove_playback(&self, stream_id: &str) -> Option<MediaSession> {
        let mut session = self.tables.write().await.playback.remove(stream_id)?;
        session.state = SessionState::Stopped;
        Some(session)
    }

    /// 按 Call-ID 移除会话（设备主动 BYE）
    pub async fn take_by_call_id(&self, call_id: &str) -> Option<MediaSession> {
        let mut tables = self.tables.write().await;
        let live_key = tables
            .live
            .iter()
            .find(|(_, s)| s.call_id == call_id)
            .map(|(k, _)| k.clone());
        let mut session = match live_key {
            Some(key) => tables.live.remove(&key)?,
            None => {
                let stream_id = tables
                    .playback
                    .iter()
                    .find(|(_, s)| s.call_id == call_id)
                    .map(|(k, _)| k.clone())?;
                tables.playback.remove(&stream_id)?
            }
        };
        session.state = SessionState::Stopped;
        Some(session)
    }

    /// 移除指定设备的全部会话
    pub async fn drop_for_devices(&self, device_ids: &[String]) -> Vec<MediaSession> {
        if device_ids.is_empty() {
            return Vec::new();
        }
        let mut tables = self.tables.write().await;
        let mut dropped = Vec::new();
        tables.live.retain(|_, s| {
            let keep = !device_ids.contains(&s.device_id);
            if !keep {
                dropped.push(s.clone());
            }
            keep
        });
        tables.playback.retain(|_, s| {
            let keep = !device_ids.contains(&s.device_id);
            if !keep {
                dropped.push(s.clone());
            }
            keep
        });
        dropped
    }

    pub async fn get(&self, device_id: &str, channel_id: &str) -> Option<MediaSession> {
        self.tables
            .read()
            .await
            .live
            .get(&(device_id.to_string(), channel_id.to_string()))
            .cloned()
    }

    pub async fn get_playback(&self, stream_id: &str) -> Option<MediaSession> {
        self.tables.read().await.playback.get(stream_id).cloned()
    }

    pub async fn get_by_call_id(&self, call_id: &str) -> Option<MediaSession> {
        self.tables
            .read()
            .await
            .iter()
            .find(|s| s.call_id == call_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<MediaSession> {
        let mut sessions: Vec<MediaSession> = self.tables.read().await.iter().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn len(&self) -> usize {
        let tables = self.tables.read().await;
        tables.live.len() + tables.playback.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// realm 中的数字取 4 位：多取末 4 位，不足右补 0
fn realm_digits(realm: &str) -> String {
    let digits: String = realm.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 4 {
        digits[digits.len() - 4..].to_string()
    } else {
        format!("{:0<4}", digits)
    }
}

/// SSRC = 实时/回放标志(0/1) + 4 位域编码 + 5 位序号
pub fn generate_ssrc(realm: &str, playback: bool, seq: u32) -> String {
    format!(
        "{}{}{:05}",
        u8::from(playback),
        realm_digits(realm),
        seq % 100_000
    )
}

/// 流 ID：去掉 '-' 的设备编码，通道与设备不同时追加 `_<通道>`
pub fn generate_stream_id(device_id: &str, channel_id: &str) -> String {
    let device = device_id.replace('-', "");
    if channel_id.is_empty() || channel_id == device_id {
        device
    } else {
        format!("{}_{}", device, channel_id.replace('-', ""))
    }
}

/// 回放流 ID：`<实时流 ID>_<起始时间 YYYYMMDDhhmmss>`
pub fn playback_stream_id(device_id: &str, channel_id: &str, range: &TimeRange) -> String {
    format!(
        "{}_{}",
        generate_stream_id(device_id, channel_id),
        range.start.format("%Y%m%d%H%M%S")
    )
}

/// SSRC 必须是 10 位十进制数字
pub fn is_valid_ssrc(ssrc: &str) -> bool {
    ssrc.len() == 10 && ssrc.bytes().all(|b| b.is_ascii_digit())
}

static ID_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    ID_SEQ.fetch_add(1, Ordering::Relaxed)
}

fn now_nanos() -> u64 {
    let now = Utc::now();
    now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()) as u64
}

pub fn generate_call_id(local_ip: &str) -> String {
    format!("{:x}{:x}@{}", now_nanos(), next_seq(), local_ip)
}

/// 纯数字 tag
pub fn generate_tag() -> String {
    format!("{}{}", now_nanos() % 1_000_000_000, next_seq() % 1000)
}

pub fn generate_branch() -> String {
    format!("z9hG4bK{}{}", now_nanos() % 1_000_000_000, next_seq() % 10_000)
}

/// 消息序号（MANSCDP SN）
pub fn generate_sn() -> u32 {
    ((now_nanos() / 1_000_000) % 1_000_000) as u32 + (next_seq() % 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DEVICE: &str = "34020000001320000001";
    const CHANNEL: &str = "34020000001310000001";

    fn request(channel_id: &str) -> NewSession {
        NewSession {
            device_id: DEVICE.to_string(),
            channel_id: channel_id.to_string(),
            rtp_port: 30000,
            media_ip: "192.168.1.100".to_string(),
            remote_addr: "192.168.1.50:5060".parse().unwrap(),
            realm: "3402000000".to_string(),
            local_ip: "192.168.1.100".to_string(),
        }
    }

    #[test]
    fn test_ssrc_encoding() {
        assert_eq!(generate_ssrc("3402000000", false, 42), "0000000042");
        assert_eq!(generate_ssrc("3402000000", true, 123456), "1000023456");
        assert_eq!(generate_ssrc("340211", false, 1), "0021100001");
        assert_eq!(generate_ssrc("34", false, 7), "0340000007");
        assert_eq!(generate_ssrc("34020000001", false, 99999).len(), 10);
    }

    #[test]
    fn test_stream_id() {
        assert_eq!(generate_stream_id(DEVICE, ""), DEVICE);
        assert_eq!(generate_stream_id(DEVICE, DEVICE), DEVICE);
        assert_eq!(
            generate_stream_id("3402-0000", "3402-0001"),
            "34020000_34020001"
        );
    }

    #[test]
    fn test_identifiers() {
        let a = generate_call_id("10.0.0.1");
        let b = generate_call_id("10.0.0.1");
        assert_ne!(a, b);
        assert!(a.ends_with("@10.0.0.1"));
        assert!(generate_tag().bytes().all(|c| c.is_ascii_digit()));
        assert!(generate_branch().starts_with("z9hG4bK"));
    }

    #[tokio::test]
    async fn test_reserve_then_playing() {
        let manager = SessionManager::new();
        let session = match manager.reserve(request(CHANNEL), Duration::from_secs(10)).await {
            Reservation::Created(s) => s,
            Reservation::Existing(_) => panic!("expected a new session"),
        };
        assert_eq!(session.state, SessionState::Inviting);
        assert_eq!(session.ssrc.len(), 10);
        assert!(session.ssrc.starts_with('0'));
        assert_eq!(session.stream_id, format!("{}_{}", DEVICE, CHANNEL));

        // 1xx 忽略
        assert!(manager
            .apply_invite_response(&session.call_id, 100, None, "")
            .await
            .is_none());

        let answer = "v=0\r\nc=IN IP4 192.168.1.50\r\nm=video 15060 RTP/AVP 96\r\ny=0340200777\r\n";
        let updated = manager
            .apply_invite_response(&session.call_id, 200, Some("88"), answer)
            .await
            .unwrap();
        assert_eq!(updated.state, SessionState::Playing);
        assert_eq!(updated.to_tag, "88");
        // 本端分配的 SSRC 不随应答改变，设备回填的值单独记录
        assert_eq!(updated.ssrc, session.ssrc);
        assert_eq!(updated.answered_ssrc.as_deref(), Some("0340200777"));
        assert!(updated.started_at.is_some());

        // playing 会话再次点播直接复用
        match manager.reserve(request(CHANNEL), Duration::from_secs(10)).await {
            Reservation::Existing(s) => assert_eq!(s.call_id, session.call_id),
            Reservation::Created(_) => panic!("expected the playing session"),
        }
    }

    #[tokio::test]
    async fn test_failed_and_stale_sessions_are_replaced() {
        let manager = SessionManager::new();
        let first = manager
            .reserve(request(CHANNEL), Duration::from_secs(10))
            .await
            .into_session();

        // 邀请超时后可重新点播
        let second = manager.reserve(request(CHANNEL), Duration::ZERO).await;
        assert!(matches!(second, Reservation::Created(_)));
        let second = second.into_session();
        assert_ne!(first.call_id, second.call_id);

        manager
            .apply_invite_response(&second.call_id, 486, None, "")
            .await;
        assert_eq!(
            manager.get(DEVICE, CHANNEL).await.unwrap().state,
            SessionState::Failed
        );
        assert!(matches!(
            manager.reserve(request(CHANNEL), Duration::from_secs(10)).await,
            Reservation::Created(_)
        ));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_reserve_creates_one_session() {
        let manager = Arc::new(SessionManager::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.reserve(request(CHANNEL), Duration::from_secs(10)).await
            }));
        }

        let mut created = 0;
        let mut call_ids = HashSet::new();
        for handle in handles {
            let reservation = handle.await.unwrap();
            if matches!(reservation, Reservation::Created(_)) {
                created += 1;
            }
            call_ids.insert(reservation.into_session().call_id);
        }
        assert_eq!(created, 1);
        assert_eq!(call_ids.len(), 1);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_ssrc_unique_among_live_sessions() {
        let manager = SessionManager::new();
        let mut ssrcs = HashSet::new();
        for i in 0..50 {
            let session = manager
                .reserve(request(&format!("3402000000131{:07}", i)), Duration::from_secs(10))
                .await
                .into_session();
            ssrcs.insert(session.ssrc);
        }
        assert_eq!(ssrcs.len(), 50);
    }

    #[tokio::test]
    async fn test_remove_and_take_by_call_id() {
        let manager = SessionManager::new();
        let session = manager
            .reserve(request(CHANNEL), Duration::from_secs(10))
            .await
            .into_session();

        let taken = manager.take_by_call_id(&session.call_id).await.unwrap();
        assert_eq!(taken.state, SessionState::Stopped);
        assert!(manager.remove(DEVICE, CHANNEL).await.is_none());

        manager.reserve(request(""), Duration::from_secs(10)).await;
        let dropped = manager.drop_for_devices(&[DEVICE.to_string()]).await;
        assert_eq!(dropped.len(), 1);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_mark_failed() {
        let manager = SessionManager::new();
        let session = manager
            .reserve(request(CHANNEL), Duration::from_secs(10))
            .await
            .into_session();
        assert!(manager.mark_failed(&session.call_id).await);
        assert!(!manager.mark_failed("missing").await);
        assert_eq!(
            manager.get_by_call_id(&session.call_id).await.unwrap().state,
            SessionState::Failed
        );
    }

    #[tokio::test]
    async fn test_malformed_answer_ssrc_keeps_offered_ssrc() {
        let manager = SessionManager::new();
        let session = manager
            .reserve(request(CHANNEL), Duration::from_secs(10))
            .await
            .into_session();

        let updated = manager
            .apply_invite_response(&session.call_id, 200, Some("tag123"), "v=0\r\ny=42\r\n")
            .await
            .unwrap();
        assert_eq!(updated.state, SessionState::Playing);
        assert_eq!(updated.ssrc, session.ssrc);
        assert_eq!(updated.ssrc.len(), 10);
        assert!(updated.answered_ssrc.is_none());

        let stored = manager.get(DEVICE, CHANNEL).await.unwrap();
        assert_eq!(stored.ssrc, session.ssrc);
        assert!(is_valid_ssrc(&stored.ssrc));
        assert!(!is_valid_ssrc("034020077a"));
    }

    #[tokio::test]
    async fn test_reserve_playback() {
        let manager = SessionManager::new();
        let range = TimeRange::parse("2025-12-23T08:00:00", "2025-12-23T09:00:00").unwrap();

        let session = match manager
            .reserve_playback(request(CHANNEL), range, Duration::from_secs(10))
            .await
        {
            Reservation::Created(s) => s,
            Reservation::Existing(_) => panic!("expected a new playback session"),
        };
        assert_eq!(session.kind, SessionKind::Playback);
        assert!(session.ssrc.starts_with('1'));
        assert_eq!(session.range, Some(range));
        assert_eq!(
            session.stream_id,
            format!("{}_{}_20251223080000", DEVICE, CHANNEL)
        );

        // 同一起始时间复用，回放与实时点播互不影响
        assert!(matches!(
            manager
                .reserve_playback(request(CHANNEL), range, Duration::from_secs(10))
                .await,
            Reservation::Existing(_)
        ));
        let live = manager
            .reserve(request(CHANNEL), Duration::from_secs(10))
            .await;
        assert!(matches!(live, Reservation::Created(_)));
        assert_ne!(live.session().ssrc, session.ssrc);
        assert_eq!(manager.len().await, 2);
        assert!(manager.get(DEVICE, CHANNEL).await.is_some());

        let other = TimeRange::parse("2025-12-23T10:00:00", "2025-12-23T11:00:00").unwrap();
        assert!(matches!(
            manager
                .reserve_playback(request(CHANNEL), other, Duration::from_secs(10))
                .await,
            Reservation::Created(_)
        ));
        assert_eq!(manager.len().await, 3);

        let taken = manager.take_by_call_id(&session.call_id).await.unwrap();
        assert_eq!(taken.kind, SessionKind::Playback);
        assert_eq!(taken.state, SessionState::Stopped);
        assert!(manager.get_playback(&session.stream_id).await.is_none());

        let other_id = playback_stream_id(DEVICE, CHANNEL, &other);
        assert!(manager.remove_playback(&other_id).await.is_some());
        assert!(manager.remove_playback(&other_id).await.is_none());
        assert_eq!(manager.len().await, 1);
    }
}
