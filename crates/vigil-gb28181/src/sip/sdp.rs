// GB28181 点播 SDP
// 生成 INVITE 携带的 offer，解析设备 200 OK 中的 answer（关注 c=、m= 与 y=）

use std::fmt;

/// SDP 会话描述
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u8,

    /// o= 中的会话源（本平台编码或设备编码）
    pub origin: String,

    /// s= 会话名称（Play/Playback）
    pub session_name: String,

    /// u= 回放时的 `<通道>:<类型>`
    pub uri: Option<String>,

    /// c= 连接地址
    pub connection_address: String,

    /// t= 起止时间；实时点播为 0 0
    pub timing: (i64, i64),

    /// SSRC（y= 行，10 位十进制字符串，首位为实时/回放标志）
    pub ssrc: Option<String>,

    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,
    pub attributes: Vec<String>,
}

/// a=rtpmap 映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,

    /// 编码名称（PS/H264/MPEG4）
    pub encoding_name: String,

    pub clock_rate: u32,
}

impl SdpSession {
    /// 实时点播 offer：PS/90000 over RTP/AVP，仅接收
    pub fn play_offer(origin: &str, media_ip: &str, rtp_port: u16, ssrc: &str) -> Self {
        Self {
            version: 0,
            origin: origin.to_string(),
            session_name: "Play".to_string(),
            uri: None,
            connection_address: media_ip.to_string(),
            timing: (0, 0),
            ssrc: Some(ssrc.to_string()),
            media: vec![SdpMedia {
                media_type: "video".to_string(),
                port: rtp_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec![96],
                rtpmap: vec![RtpMap {
                    payload_type: 96,
                    encoding_name: "PS".to_string(),
                    clock_rate: 90000,
                }],
                attributes: vec!["recvonly".to_string()],
            }],
        }
    }

    /// 录像回放 offer：与实时点播相同的媒体描述，携带通道 URI 与回放时间段
    pub fn playback_offer(
        origin: &str,
        media_ip: &str,
        rtp_port: u16,
        ssrc: &str,
        channel_id: &str,
        timing: (i64, i64),
    ) -> Self {
        Self {
            session_name: "Playback".to_string(),
            uri: Some(format!("{}:0", channel_id)),
            timing,
            ..Self::play_offer(origin, media_ip, rtp_port, ssrc)
        }
    }

    /// 解析 SDP 文本；无法识别的行忽略
    pub fn parse(sdp: &str) -> Self {
        let mut session = SdpSession::default();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "v" => session.version = value.parse().unwrap_or(0),
                "o" => {
                    if let Some(origin) = value.split_whitespace().next() {
                        session.origin = origin.to_string();
                    }
                }
                "s" => session.session_name = value.to_string(),
                "u" => session.uri = Some(value.to_string()),
                "t" => {
                    let mut parts = value.split_whitespace().map(|v| v.parse::<i64>().unwrap_or(0));
                    session.timing = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
                }
                "c" => {
                    if let Some(address) = value.split_whitespace().nth(2) {
                        session.connection_address = address.to_string();
                    }
                }
                "y" => {
                    let ssrc = value.trim();
                    if !ssrc.is_empty() && ssrc.bytes().all(|b| b.is_ascii_digit()) {
                        session.ssrc = Some(ssrc.to_string());
                    }
                }
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                            rtpmap: Vec::new(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a" => {
                    let Some(media) = current_media.as_mut() else {
                        continue;
                    };
                    match value.strip_prefix("rtpmap:").and_then(parse_rtpmap) {
                        Some(rtpmap) => media.rtpmap.push(rtpmap),
                        None => media.attributes.push(value.to_string()),
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }
        session
    }

    /// 第一个视频媒体的端口
    pub fn video_port(&self) -> Option<u16> {
        self.media
            .iter()
            .find(|m| m.media_type == "video")
            .map(|m| m.port)
    }
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (payload_type, rest) = value.split_once(' ')?;
    let (encoding_name, clock_rate) = rest.split_once('/')?;
    let clock_rate = clock_rate.split('/').next()?;
    Some(RtpMap {
        payload_type: payload_type.trim().parse().ok()?,
        encoding_name: encoding_name.trim().to_string(),
        clock_rate: clock_rate.trim().parse().unwrap_or(90000),
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.origin, self.connection_address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(uri) = &self.uri {
            write!(f, "u={}\r\n", uri)?;
        }
        write!(f, "c=IN IP4 {}\r\n", self.connection_address)?;
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|p| p.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
            for rtpmap in &media.rtpmap {
                write!(
                    f,
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                )?;
            }
        }

        // y= 为 GB28181 扩展，放在媒体描述之后
        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }
        Ok(())
    }
}
