// GB28181 SIP 服务器
// 处理设备注册、心跳、目录/设备信息、录像检索、实时点播/回放与云台控制

use super::auth::DigestAuthenticator;
use super::catalog::{
    parse_manscdp, root_element, ManscdpMessage, Query, QueryCmd, RecordInfoQuery, RecordType,
    MANSCDP_CONTENT_TYPE,
};
use super::config::SipServerConfig;
use super::heartbeat;
use super::message::{
    extract_host_port, extract_uri, extract_user, frame_length, header_param, parse_cseq,
    ParseError, MAX_FRAME_LEN, SipMessage, SipMethod, SipRequest, SipResponse,
};
use super::ptz::{control_xml, encode_ptz_command, normalize_speed, PtzCommand};
use super::record::{RecordCache, TimeRange};
use super::registry::{Device, DeviceRegistry, Transport};
use super::sdp::SdpSession;
use super::session::{
    generate_branch, generate_call_id, generate_sn, generate_tag, MediaSession, NewSession,
    Reservation, SessionManager,
};
use crate::{Gb28181Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::Instrument;

/// 应答的回送路径
#[derive(Clone)]
enum ReplyTarget {
    Udp(SocketAddr),
    Tcp {
        peer: SocketAddr,
        writer: Arc<Mutex<OwnedWriteHalf>>,
    },
}

impl ReplyTarget {
    fn peer(&self) -> SocketAddr {
        match self {
            ReplyTarget::Udp(addr) => *addr,
            ReplyTarget::Tcp { peer, .. } => *peer,
        }
    }

    fn transport(&self) -> Transport {
        match self {
            ReplyTarget::Udp(_) => Transport::Udp,
            ReplyTarget::Tcp { .. } => Transport::Tcp,
        }
    }
}

/// GB28181 SIP 服务器
pub struct SipServer {
    config: SipServerConfig,
    authenticator: DigestAuthenticator,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    records: RecordCache,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    tcp_listener: Mutex<Option<TcpListener>>,
    tcp_local_addr: Option<SocketAddr>,
    dispatch_limit: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl SipServer {
    /// 绑定 UDP（及可选 TCP）监听
    pub async fn bind(config: SipServerConfig) -> Result<Self> {
        Self::bind_with_registry(config, Arc::new(DeviceRegistry::new())).await
    }

    /// 使用外部构造的注册表（可携带观察者）
    pub async fn bind_with_registry(
        config: SipServerConfig,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr()).await?;
        let local_addr = socket.local_addr()?;

        let tcp_listener = if config.tcp_enabled {
            let same_port = SocketAddr::new(local_addr.ip(), local_addr.port());
            let listener = match TcpListener::bind(same_port).await {
                Ok(listener) => listener,
                // 端口由系统分配时，TCP 允许落到另一个端口
                Err(_) if config.sip_port == 0 => {
                    TcpListener::bind(SocketAddr::new(local_addr.ip(), 0)).await?
                }
                Err(e) => return Err(e.into()),
            };
            Some(listener)
        } else {
            None
        };
        let tcp_local_addr = match &tcp_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        tracing::info!(
            target: "gb28181::sip",
            udp = %local_addr,
            tcp = ?tcp_local_addr,
            realm = %config.realm,
            server_id = %config.server_id,
            auth = config.password.is_some(),
            "GB28181 SIP server listening",
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            authenticator: DigestAuthenticator::new(config.realm.clone(), config.password.clone()),
            dispatch_limit: Arc::new(Semaphore::new(config.max_concurrent_dispatch.max(1))),
            config,
            registry,
            sessions: Arc::new(SessionManager::new()),
            records: RecordCache::new(),
            socket: Arc::new(socket),
            local_addr,
            tcp_listener: Mutex::new(tcp_listener),
            tcp_local_addr,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &SipServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 录像检索结果
    pub fn records(&self) -> &RecordCache {
        &self.records
    }

    pub fn authenticator(&self) -> &DigestAuthenticator {
        &self.authenticator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp_local_addr
    }

    /// 通知所有读循环退出；已分发的处理任务会继续执行完
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// 运行服务器直到关闭
    pub async fn run(self: Arc<Self>) {
        tracing::info!(target: "gb28181::sip", "GB28181 SIP server started");

        let sweeper = tokio::spawn(heartbeat::run_sweeper(
            self.registry.clone(),
            self.sessions.clone(),
            self.config.sweep_interval(),
            self.config.heartbeat_timeout(),
            self.shutdown_tx.subscribe(),
        ));

        let tcp = match self.tcp_listener.lock().await.take() {
            Some(listener) => Some(tokio::spawn(self.clone().tcp_accept_loop(listener))),
            None => None,
        };

        self.clone().udp_loop().await;

        if let Some(tcp) = tcp {
            let _ = tcp.await;
        }
        let _ = sweeper.await;
        tracing::info!(target: "gb28181::sip", "GB28181 SIP server stopped");
    }

    async fn udp_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut buf = vec![0u8; 65536];
        loop {
            // 许可耗尽时停止收包，形成背压
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.dispatch_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => {
                        let data = buf[..len].to_vec();
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_packet(&data, ReplyTarget::Udp(addr)).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "Failed to receive UDP packet");
                    }
                },
            }
        }
    }

    async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(target: "gb28181::sip", remote = %peer, "TCP connection accepted");
                        tokio::spawn(self.clone().tcp_connection(stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "Failed to accept TCP connection");
                    }
                },
            }
        }
    }

    async fn tcp_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let target = ReplyTarget::Tcp {
            peer,
            writer: Arc::new(Mutex::new(writer)),
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut pending: Vec<u8> = Vec::with_capacity(8192);
        let mut chunk = vec![0u8; 8192];

        'read: loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(target: "gb28181::sip", remote = %peer, error = %e, "TCP read failed");
                        break;
                    }
                },
            };
            pending.extend_from_slice(&chunk[..n]);

            loop {
                let len = match frame_length(&pending) {
                    Ok(Some(len)) => len,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", remote = %peer, error = %e, "Invalid TCP frame, closing connection");
                        break 'read;
                    }
                };
                let frame: Vec<u8> = pending.drain(..len).collect();
                if frame.iter().all(|b| *b == b'\r' || *b == b'\n') {
                    continue;
                }
                self.handle_packet(&frame, target.clone()).await;
            }

            if pending.len() > MAX_FRAME_LEN {
                tracing::warn!(target: "gb28181::sip", remote = %peer, "TCP buffer overflow, closing connection");
                break;
            }
        }

        tracing::debug!(target: "gb28181::sip", remote = %peer, "TCP connection closed");
    }

    /// 处理一条报文；解析与鉴权错误只记录日志
    async fn handle_packet(self: &Arc<Self>, data: &[u8], target: ReplyTarget) {
        let span = tracing::info_span!(
            "gb28181.sip.handle_message",
            remote = %target.peer(),
            bytes = data.len()
        );

        async {
            match SipMessage::parse(data) {
                Ok(SipMessage::Request(req)) => self.handle_request(req, &target).await,
                Ok(SipMessage::Response(resp)) => self.handle_response(resp, &target).await,
                Err(ParseError::MalformedHeader(line)) if starts_with_request_line(data) => {
                    tracing::warn!(target: "gb28181::sip", %line, "Malformed SIP header");
                    let resp = SipResponse::new(400, "Bad Request");
                    self.reply(&target, &resp.to_bytes()).await;
                }
                Err(e) => {
                    tracing::debug!(target: "gb28181::sip", error = %e, "Dropping unparsable packet");
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_request(self: &Arc<Self>, req: SipRequest, target: &ReplyTarget) {
        let method = req.method.clone();
        match method {
            SipMethod::Register => self.handle_register(req, target).await,
            SipMethod::Message => self.handle_message(req, target).await,
            SipMethod::Invite => {
                // 设备发起的 INVITE 只应答，不做协商
                tracing::info!(target: "gb28181::sip", call_id = ?req.call_id(), "Inbound INVITE acknowledged");
                self.reply(target, &SipResponse::reply_to(&req, 200, "OK").to_bytes()).await;
            }
            SipMethod::Ack => {
                tracing::debug!(target: "gb28181::sip", call_id = ?req.call_id(), "ACK received");
            }
            SipMethod::Bye => self.handle_bye(req, target).await,
            SipMethod::Options => {
                if let Some(device_id) = req.header("From").and_then(extract_user) {
                    self.registry.update_keepalive(device_id).await;
                }
                self.reply(target, &SipResponse::reply_to(&req, 200, "OK").to_bytes()).await;
            }
            other => {
                tracing::warn!(target: "gb28181::sip", method = %other, "Unsupported SIP method");
            }
        }
    }

    /// 处理 REGISTER（注册、刷新、注销）
    async fn handle_register(self: &Arc<Self>, req: SipRequest, target: &ReplyTarget) {
        let Some(device_id) = req.header("From").and_then(extract_user).map(str::to_string) else {
            tracing::warn!(target: "gb28181::sip", "REGISTER without device id in From");
            self.reply(target, &SipResponse::reply_to(&req, 400, "Bad Request").to_bytes()).await;
            return;
        };

        let peer = target.peer();
        let span = tracing::info_span!("gb28181.sip.register", %device_id, remote = %peer);
        async {
            if !self.authenticator.authenticate(&req).await {
                if req.header("Authorization").is_some() {
                    let err = Gb28181Error::AuthenticationFailed(device_id.clone());
                    tracing::warn!(target: "gb28181::sip", error = %err, "REGISTER rejected");
                } else {
                    tracing::debug!(target: "gb28181::sip", "REGISTER challenged");
                }
                let mut resp = SipResponse::reply_to(&req, 401, "Unauthorized");
                resp.add_header("WWW-Authenticate", self.authenticator.challenge().await);
                self.reply(target, &resp.to_bytes()).await;
                return;
            }

            let contact = req.header("Contact");
            let (ip, port) = contact
                .and_then(extract_host_port)
                .filter(|(host, _)| host.parse::<IpAddr>().is_ok())
                .unwrap_or_else(|| (peer.ip().to_string(), peer.port()));

            let expires = req
                .header("Expires")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .or_else(|| {
                    contact
                        .and_then(|c| header_param(c, "expires"))
                        .and_then(|v| v.parse::<u32>().ok())
                })
                .unwrap_or(self.config.register_expires);

            let mut resp = SipResponse::reply_to(&req, 200, "OK");
            resp.add_header("Expires", expires.to_string());

            if expires == 0 {
                self.registry.remove_device(&device_id).await;
                self.sessions.drop_for_devices(&[device_id.clone()]).await;
                tracing::info!(target: "gb28181::sip", "Device unregistered");
                self.reply(target, &resp.to_bytes()).await;
                return;
            }

            let inserted = self
                .registry
                .register(&device_id, "", &ip, port, expires, target.transport())
                .await;
            self.reply(target, &resp.to_bytes()).await;

            if inserted && self.config.auto_query {
                let server = self.clone();
                let device_id = device_id.clone();
                tokio::spawn(async move {
                    server.auto_query(&device_id).await;
                });
            }
        }
        .instrument(span)
        .await
    }

    /// 新设备上线后依次查询设备信息和目录
    async fn auto_query(&self, device_id: &str) {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Err(e) = self.query_device_info(device_id).await {
            tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "Auto DeviceInfo query failed");
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Err(e) = self.query_catalog(device_id).await {
            tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "Auto Catalog query failed");
        }
    }

    /// 处理 MESSAGE（心跳、目录、设备信息）
    async fn handle_message(self: &Arc<Self>, req: SipRequest, target: &ReplyTarget) {
        self.reply(target, &SipResponse::reply_to(&req, 200, "OK").to_bytes()).await;

        let Some(device_id) = req.header("From").and_then(extract_user).map(str::to_string) else {
            tracing::debug!(target: "gb28181::sip", "MESSAGE without device id");
            return;
        };

        if !self.registry.update_keepalive(&device_id).await {
            tracing::debug!(target: "gb28181::sip", %device_id, "MESSAGE from unregistered device");
            return;
        }

        let body = req.body.trim();
        if body.is_empty() {
            return;
        }

        let msg = match parse_manscdp(body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", %device_id, error = %e, "Invalid MANSCDP body");
                return;
            }
        };

        match (root_element(body), msg.cmd_type.as_str()) {
            (_, "Keepalive") => {
                tracing::debug!(target: "gb28181::sip", %device_id, "Keepalive received from device");
            }
            (Some("Response"), "Catalog") => self.ingest_catalog(&device_id, &msg).await,
            (Some("Response"), "RecordInfo") => self.ingest_records(&device_id, &msg).await,
            (Some("Response"), "DeviceInfo") => {
                self.registry.update_device_info(&device_id, msg.device_info()).await;
                tracing::info!(
                    target: "gb28181::sip",
                    %device_id,
                    manufacturer = %msg.manufacturer,
                    model = %msg.model,
                    "Device info updated",
                );
            }
            (root, cmd_type) => {
                tracing::debug!(target: "gb28181::sip", %device_id, ?root, %cmd_type, "Unhandled MESSAGE");
            }
        }
    }

    /// 目录应答入库（分页应答逐页幂等合并）
    async fn ingest_catalog(&self, device_id: &str, msg: &ManscdpMessage) {
        let span = tracing::info_span!(
            "gb28181.sip.catalog_response",
            %device_id,
            sum_num = msg.sum_num.unwrap_or(0)
        );
        async {
            let mut added = 0;
            for item in msg.items() {
                if item.device_id == device_id {
                    self.registry.update_device_info(device_id, item.device_info()).await;
                    continue;
                }
                if self.registry.add_or_update_channel(device_id, item.to_channel()).await {
                    added += 1;
                }
            }
            tracing::info!(
                target: "gb28181::sip",
                items = msg.items().len(),
                added,
                "Received catalog from device",
            );
        }
        .instrument(span)
        .await
    }

    /// 录像检索应答按通道合并；通道取应答中的 DeviceID
    async fn ingest_records(&self, device_id: &str, msg: &ManscdpMessage) {
        let channel_id = if msg.device_id.is_empty() { device_id } else { msg.device_id.as_str() };
        let sum_num = msg.sum_num.unwrap_or(0);
        match self
            .records
            .merge(device_id, channel_id, sum_num, msg.records())
            .await
        {
            Some(total) => tracing::info!(
                target: "gb28181::sip",
                %device_id,
                %channel_id,
                items = msg.records().len(),
                total,
                sum_num,
                "Received record list from device",
            ),
            None => tracing::debug!(
                target: "gb28181::sip",
                %device_id,
                %channel_id,
                "Unsolicited RecordInfo response",
            ),
        }
    }

    async fn handle_bye(&self, req: SipRequest, target: &ReplyTarget) {
        if let Some(call_id) = req.call_id() {
            match self.sessions.take_by_call_id(call_id).await {
                Some(session) => tracing::info!(
                    target: "gb28181::sip",
                    device_id = %session.device_id,
                    channel_id = %session.channel_id,
                    stream_id = %session.stream_id,
                    kind = ?session.kind,
                    "Device ended media session",
                ),
                None => tracing::debug!(target: "gb28181::sip", %call_id, "BYE for unknown session"),
            }
        }
        self.reply(target, &SipResponse::reply_to(&req, 200, "OK").to_bytes()).await;
    }

    /// 处理应答（按 CSeq 方法分发）
    async fn handle_response(&self, resp: SipResponse, target: &ReplyTarget) {
        let Some((seq, method)) = resp.header("CSeq").and_then(parse_cseq) else {
            tracing::debug!(target: "gb28181::sip", status = resp.status_code, "Response without CSeq");
            return;
        };

        match method {
            SipMethod::Invite => {
                if resp.is_provisional() {
                    tracing::debug!(target: "gb28181::sip", status = resp.status_code, "Provisional INVITE response");
                    return;
                }
                let Some(call_id) = resp.call_id() else {
                    return;
                };
                let to_tag = resp.header("To").and_then(|to| header_param(to, "tag"));
                self.handle_invite_response(resp.status_code, call_id, to_tag, &resp.body)
                    .await;

                if resp.is_success() {
                    self.send_ack(&resp, seq, target).await;
                }
            }
            other => {
                tracing::debug!(
                    target: "gb28181::sip",
                    status = resp.status_code,
                    method = %other,
                    "Response received",
                );
            }
        }
    }

    /// INVITE 应答：2xx 进入 playing，>=300 标记失败
    pub async fn handle_invite_response(
        &self,
        status_code: u16,
        call_id: &str,
        to_tag: Option<&str>,
        body: &str,
    ) -> Option<MediaSession> {
        let session = self
            .sessions
            .apply_invite_response(call_id, status_code, to_tag, body)
            .await;

        match &session {
            Some(s) => tracing::info!(
                target: "gb28181::sip",
                device_id = %s.device_id,
                channel_id = %s.channel_id,
                status = status_code,
                state = ?s.state,
                ssrc = %s.ssrc,
                answered_ssrc = ?s.answered_ssrc,
                "INVITE response applied",
            ),
            None if status_code >= 200 => tracing::debug!(
                target: "gb28181::sip",
                %call_id,
                status = status_code,
                "INVITE response for unknown session",
            ),
            None => {}
        }
        session
    }

    async fn send_ack(&self, resp: &SipResponse, seq: u32, target: &ReplyTarget) {
        let uri = resp
            .header("Contact")
            .and_then(extract_uri)
            .or_else(|| resp.header("To").and_then(extract_uri))
            .map(str::to_string)
            .unwrap_or_else(|| format!("sip:{}", target.peer()));

        let local_ip = self.local_ip_for(target.peer().ip()).await;
        let mut ack = SipRequest::new(SipMethod::Ack, uri);
        ack.add_header("Via", self.via(target.transport(), &local_ip));
        for key in ["From", "To", "Call-ID"] {
            if let Some(value) = resp.header(key) {
                ack.add_header(key, value);
            }
        }
        ack.add_header("CSeq", format!("{} ACK", seq));
        ack.add_header("Max-Forwards", "70");

        self.reply(target, &ack.to_bytes()).await;
    }

    /// 向设备发起实时点播
    pub async fn invite(
        &self,
        device_id: &str,
        channel_id: &str,
        rtp_port: u16,
        media_ip: Option<&str>,
    ) -> Result<MediaSession> {
        self.open_session(device_id, channel_id, rtp_port, media_ip, None)
            .await
    }

    /// 向设备发起录像回放
    pub async fn start_playback(
        &self,
        device_id: &str,
        channel_id: &str,
        range: TimeRange,
        rtp_port: u16,
        media_ip: Option<&str>,
    ) -> Result<MediaSession> {
        self.open_session(device_id, channel_id, rtp_port, media_ip, Some(range))
            .await
    }

    async fn open_session(
        &self,
        device_id: &str,
        channel_id: &str,
        rtp_port: u16,
        media_ip: Option<&str>,
        range: Option<TimeRange>,
    ) -> Result<MediaSession> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))?;
        let channel_id = if channel_id.is_empty() { device_id } else { channel_id };
        let remote = device_addr(&device)?;

        let span = match &range {
            None => tracing::info_span!(
                "gb28181.sip.invite",
                %device_id,
                %channel_id,
                remote = %remote
            ),
            Some(range) => tracing::info_span!(
                "gb28181.sip.playback",
                %device_id,
                %channel_id,
                remote = %remote,
                start = %range.start,
                end = %range.end
            ),
        };
        async {
            let media_ip = self.resolve_media_ip(media_ip, remote.ip()).await;
            let local_ip = self.local_ip_for(remote.ip()).await;

            let request = NewSession {
                device_id: device_id.to_string(),
                channel_id: channel_id.to_string(),
                rtp_port,
                media_ip,
                remote_addr: remote,
                realm: self.config.realm.clone(),
                local_ip: local_ip.clone(),
            };
            let reservation = match range {
                None => self.sessions.reserve(request, self.config.invite_timeout()).await,
                Some(range) => {
                    self.sessions
                        .reserve_playback(request, range, self.config.invite_timeout())
                        .await
                }
            };

            let session = match reservation {
                Reservation::Existing(session) => {
                    tracing::info!(
                        target: "gb28181::sip",
                        state = ?session.state,
                        call_id = %session.call_id,
                        stream_id = %session.stream_id,
                        "Reusing media session",
                    );
                    return Ok(session);
                }
                Reservation::Created(session) => session,
            };

            let sdp = match &session.range {
                None => SdpSession::play_offer(
                    &self.config.server_id,
                    &session.media_ip,
                    session.rtp_port,
                    &session.ssrc,
                ),
                Some(range) => SdpSession::playback_offer(
                    &self.config.server_id,
                    &session.media_ip,
                    session.rtp_port,
                    &session.ssrc,
                    channel_id,
                    range.sdp_timing(),
                ),
            };

            let mut req = SipRequest::new(
                SipMethod::Invite,
                format!("sip:{}@{}:{}", channel_id, device.sip_ip, device.sip_port),
            );
            req.add_header("Via", self.via(Transport::Udp, &local_ip));
            req.add_header(
                "From",
                format!("<sip:{}@{}>;tag={}", self.config.server_id, self.config.realm, session.from_tag),
            );
            req.add_header("To", format!("<sip:{}@{}>", channel_id, self.config.realm));
            req.add_header("Call-ID", session.call_id.clone());
            req.add_header("CSeq", "1 INVITE");
            req.add_header("Contact", self.contact(&local_ip));
            req.add_header("Max-Forwards", "70");
            req.add_header(
                "Subject",
                format!("{}:{},{}:0", channel_id, session.ssrc, self.config.server_id),
            );
            req.add_header("Content-Type", "APPLICATION/SDP");
            req.set_body(sdp.to_string());

            if let Err(e) = self.socket.send_to(&req.to_bytes(), remote).await {
                tracing::error!(target: "gb28181::sip", error = %e, "Failed to send INVITE");
                self.sessions.mark_failed(&session.call_id).await;
                return Err(Gb28181Error::Transport(e));
            }

            tracing::info!(
                target: "gb28181::sip",
                call_id = %session.call_id,
                kind = ?session.kind,
                stream_id = %session.stream_id,
                ssrc = %session.ssrc,
                rtp_port = session.rtp_port,
                media_ip = %session.media_ip,
                "INVITE sent",
            );
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// 结束点播：先删会话再尽力发送 BYE
    pub async fn bye(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let channel_id = if channel_id.is_empty() { device_id } else { channel_id };
        let session = self
            .sessions
            .remove(device_id, channel_id)
            .await
            .ok_or_else(|| Gb28181Error::SessionNotFound {
                device_id: device_id.to_string(),
                channel_id: channel_id.to_string(),
            })?;
        self.send_bye(&session).await;
        Ok(())
    }

    /// 结束回放（按流 ID）
    pub async fn stop_playback(&self, stream_id: &str) -> Result<MediaSession> {
        let session = self
            .sessions
            .remove_playback(stream_id)
            .await
            .ok_or_else(|| Gb28181Error::PlaybackNotFound(stream_id.to_string()))?;
        self.send_bye(&session).await;
        Ok(session)
    }

    /// BYE 发送失败只记录日志
    async fn send_bye(&self, session: &MediaSession) {
        let remote = session.remote_addr;
        let local_ip = self.local_ip_for(remote.ip()).await;
        let channel_id = session.channel_id.as_str();

        let mut req = SipRequest::new(
            SipMethod::Bye,
            format!("sip:{}@{}", channel_id, remote),
        );
        req.add_header("Via", self.via(Transport::Udp, &local_ip));
        req.add_header(
            "From",
            format!("<sip:{}@{}>;tag={}", self.config.server_id, self.config.realm, session.from_tag),
        );
        let mut to = format!("<sip:{}@{}>", channel_id, self.config.realm);
        if !session.to_tag.is_empty() {
            to.push_str(";tag=");
            to.push_str(&session.to_tag);
        }
        req.add_header("To", to);
        req.add_header("Call-ID", session.call_id.clone());
        req.add_header("CSeq", "2 BYE");
        req.add_header("Max-Forwards", "70");

        match self.socket.send_to(&req.to_bytes(), remote).await {
            Ok(_) => tracing::info!(
                target: "gb28181::sip",
                device_id = %session.device_id,
                %channel_id,
                call_id = %session.call_id,
                kind = ?session.kind,
                "BYE sent",
            ),
            Err(e) => tracing::warn!(
                target: "gb28181::sip",
                device_id = %session.device_id,
                %channel_id,
                error = %e,
                "Failed to send BYE",
            ),
        }
    }

    /// 查询设备目录
    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        self.send_query(QueryCmd::Catalog, device_id).await
    }

    /// 查询设备信息
    pub async fn query_device_info(&self, device_id: &str) -> Result<()> {
        self.send_query(QueryCmd::DeviceInfo, device_id).await
    }

    /// 检索通道录像；应答异步到达并写入录像缓存
    pub async fn query_record_info(
        &self,
        device_id: &str,
        channel_id: &str,
        range: TimeRange,
        record_type: RecordType,
    ) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))?;
        let channel_id = if channel_id.is_empty() { device_id } else { channel_id };

        let body = RecordInfoQuery {
            sn: generate_sn(),
            device_id: channel_id.to_string(),
            range,
            record_type,
        }
        .to_xml();

        self.records.begin(device_id, channel_id).await;
        if let Err(e) = self.send_manscdp(&device, channel_id, body).await {
            self.records.clear(channel_id).await;
            return Err(e);
        }

        tracing::info!(
            target: "gb28181::sip",
            %device_id,
            %channel_id,
            record_type = record_type.as_str(),
            start = %range.start,
            end = %range.end,
            "RecordInfo query sent",
        );
        Ok(())
    }

    async fn send_query(&self, cmd: QueryCmd, device_id: &str) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))?;

        let body = Query::new(cmd, generate_sn(), device_id).to_xml();
        self.send_manscdp(&device, device_id, body).await?;

        tracing::info!(
            target: "gb28181::sip",
            %device_id,
            cmd_type = cmd.as_str(),
            transport = %device.transport,
            "Query sent",
        );
        Ok(())
    }

    /// 云台控制
    pub async fn send_ptz(
        &self,
        device_id: &str,
        channel_id: &str,
        command: &str,
        speed: i32,
    ) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Gb28181Error::DeviceNotFound(device_id.to_string()))?;
        let target_id = if channel_id.is_empty() { device_id } else { channel_id };

        let command = PtzCommand::from(command);
        let ptz_cmd = encode_ptz_command(command, speed);
        let body = control_xml(generate_sn(), target_id, &ptz_cmd, normalize_speed(speed), target_id);
        self.send_manscdp(&device, target_id, body).await?;

        tracing::info!(
            target: "gb28181::sip",
            %device_id,
            channel_id = %target_id,
            ?command,
            %ptz_cmd,
            "PTZ command sent",
        );
        Ok(())
    }

    async fn send_manscdp(&self, device: &Device, to_user: &str, body: String) -> Result<()> {
        let remote = device_addr(device)?;
        let local_ip = self.local_ip_for(remote.ip()).await;

        let mut req = SipRequest::new(
            SipMethod::Message,
            format!("sip:{}@{}:{}", to_user, device.sip_ip, device.sip_port),
        );
        req.add_header("Via", self.via(device.transport, &local_ip));
        req.add_header(
            "From",
            format!("<sip:{}@{}>;tag={}", self.config.server_id, self.config.realm, generate_tag()),
        );
        req.add_header("To", format!("<sip:{}@{}>", to_user, self.config.realm));
        req.add_header("Call-ID", generate_call_id(&local_ip));
        req.add_header("CSeq", "1 MESSAGE");
        req.add_header("Max-Forwards", "70");
        req.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
        req.set_body(body);

        self.send_to_device(device, &req.to_bytes()).await
    }

    /// 发送到设备：TCP 设备先尝试 TCP 直连，失败回退 UDP
    pub async fn send_to_device(&self, device: &Device, data: &[u8]) -> Result<()> {
        let remote = device_addr(device)?;

        if device.transport == Transport::Tcp {
            let connect = tokio::time::timeout(
                self.config.tcp_connect_timeout(),
                TcpStream::connect(remote),
            )
            .await;
            match connect {
                Ok(Ok(mut stream)) => match stream.write_all(data).await {
                    Ok(()) => return Ok(()),
                    Err(e) => tracing::warn!(
                        target: "gb28181::sip",
                        device_id = %device.device_id,
                        error = %e,
                        "TCP write failed, falling back to UDP",
                    ),
                },
                Ok(Err(e)) => tracing::warn!(
                    target: "gb28181::sip",
                    device_id = %device.device_id,
                    error = %e,
                    "TCP connect failed, falling back to UDP",
                ),
                Err(_) => tracing::warn!(
                    target: "gb28181::sip",
                    device_id = %device.device_id,
                    "TCP connect timed out, falling back to UDP",
                ),
            }
        }

        self.socket.send_to(data, remote).await?;
        Ok(())
    }

    /// 媒体收流地址：调用方给出的可用地址 → 朝设备方向的本机地址 → 配置的 SIP IP → 127.0.0.1
    pub async fn resolve_media_ip(&self, requested: Option<&str>, device_ip: IpAddr) -> String {
        if let Some(ip) = requested.map(str::trim).filter(|ip| usable_ip(ip)) {
            return ip.to_string();
        }

        if let Some(ip) = route_local_ip(device_ip).await {
            if !ip.is_loopback() {
                return ip.to_string();
            }
        }

        match self.config.sip_ip.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip.to_string(),
            _ => "127.0.0.1".to_string(),
        }
    }

    /// 信令中使用的本机地址
    async fn local_ip_for(&self, remote: IpAddr) -> String {
        match self.config.sip_ip.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip.to_string(),
            _ => route_local_ip(remote)
                .await
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }

    fn via(&self, transport: Transport, local_ip: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            transport,
            local_ip,
            self.local_addr.port(),
            generate_branch()
        )
    }

    fn contact(&self, local_ip: &str) -> String {
        format!("<sip:{}@{}:{}>", self.config.server_id, local_ip, self.local_addr.port())
    }

    async fn reply(&self, target: &ReplyTarget, data: &[u8]) {
        let result = match target {
            ReplyTarget::Udp(addr) => self.socket.send_to(data, addr).await.map(|_| ()),
            ReplyTarget::Tcp { writer, .. } => writer.lock().await.write_all(data).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                target: "gb28181::sip",
                remote = %target.peer(),
                error = %e,
                "Failed to send SIP message",
            );
        }
    }
}

fn device_addr(device: &Device) -> Result<SocketAddr> {
    device.sip_addr().ok_or_else(|| {
        Gb28181Error::Other(format!(
            "Invalid signaling address {}:{} for device {}",
            device.sip_ip, device.sip_port, device.device_id
        ))
    })
}

fn usable_ip(ip: &str) -> bool {
    if ip.is_empty() || ip.eq_ignore_ascii_case("localhost") {
        return false;
    }
    match ip.parse::<IpAddr>() {
        Ok(addr) => !addr.is_unspecified() && !addr.is_loopback(),
        Err(_) => true,
    }
}

/// 通过一次 UDP connect 取得朝向对端的本机地址（不发送数据）
async fn route_local_ip(remote: IpAddr) -> Option<IpAddr> {
    let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(SocketAddr::new(remote, 5060)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn starts_with_request_line(data: &[u8]) -> bool {
    let head = &data[..data.len().min(256)];
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next().unwrap_or_default();
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    parts.len() == 3 && !parts[0].starts_with("SIP/") && parts[2].trim().starts_with("SIP/")
}
