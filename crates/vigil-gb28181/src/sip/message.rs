// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式；数据报已由传输层分帧，消息体读到输入末尾

use chrono::Utc;
use std::fmt;
use thiserror::Error;

/// 解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("frame exceeds {max} bytes (Content-Length {content_length})")]
    FrameTooLarge { content_length: usize, max: usize },
}

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Subscribe,
    Notify,
    Info,
    Other(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Other(name) => name,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SipMethod {
    fn from(s: &str) -> Self {
        match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "OPTIONS" => SipMethod::Options,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "INFO" => SipMethod::Info,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

/// 有序头部表（键区分大小写，按收到的原样保存）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 插入头部；同名键原位替换值
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // 折叠行：追加到上一个头部
    fn append_to_last(&mut self, continuation: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(continuation);
                true
            }
            None => false,
        }
    }

    fn write_to(&self, f: &mut fmt::Formatter<'_>, body: &str) -> fmt::Result {
        let mut length_written = false;
        for (key, value) in &self.entries {
            if is_content_length(key) {
                write!(f, "{}: {}\r\n", key, body.len())?;
                length_written = true;
            } else {
                write!(f, "{}: {}\r\n", key, value)?;
            }
        }
        if !length_written {
            write!(f, "Content-Length: {}\r\n", body.len())?;
        }
        f.write_str("\r\n")?;
        f.write_str(body)
    }
}

fn is_content_length(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length") || name == "l"
}

/// SIP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        self.headers.write_to(f, &self.body)
    }
}

/// SIP 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// 基于请求构造响应：回显事务头部并加盖 Date
    pub fn reply_to(request: &SipRequest, status_code: u16, reason_phrase: &str) -> Self {
        let mut resp = Self::new(status_code, reason_phrase);
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(key) {
                resp.add_header(key, value);
            }
        }
        resp.add_header("Date", http_date());
        resp
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        )?;
        self.headers.write_to(f, &self.body)
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 解析一条完整的 SIP 报文
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_start_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let (start_line, mut rest) = split_line(text);
        let tokens: Vec<&str> = start_line.splitn(3, ' ').collect();
        if tokens.len() < 3 || tokens[0].is_empty() || tokens[1].is_empty() {
            return Err(ParseError::MalformedRequestLine(start_line.to_string()));
        }

        let mut headers = Headers::new();
        while !rest.is_empty() {
            let (line, remainder) = split_line(rest);
            rest = remainder;
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if !headers.append_to_last(line.trim()) {
                    return Err(ParseError::MalformedHeader(line.to_string()));
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                return Err(ParseError::MalformedHeader(line.to_string()));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(ParseError::MalformedHeader(line.to_string()));
            }
            headers.insert(name, value.trim());
        }
        let body = rest.to_string();

        if tokens[0].starts_with("SIP/") {
            let status_code = tokens[1]
                .parse::<u16>()
                .ok()
                .filter(|code| (100..700).contains(code))
                .ok_or_else(|| ParseError::MalformedRequestLine(start_line.to_string()))?;
            Ok(SipMessage::Response(SipResponse {
                version: tokens[0].to_string(),
                status_code,
                reason_phrase: tokens[2].to_string(),
                headers,
                body,
            }))
        } else {
            if tokens[2].is_empty() {
                return Err(ParseError::MalformedRequestLine(start_line.to_string()));
            }
            Ok(SipMessage::Request(SipRequest {
                method: SipMethod::from(tokens[0]),
                uri: tokens[1].to_string(),
                version: tokens[2].to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => fmt::Display::fmt(req, f),
            SipMessage::Response(resp) => fmt::Display::fmt(resp, f),
        }
    }
}

// 取一行（去掉行尾 \r，兼容裸 \n）
fn split_line(s: &str) -> (&str, &str) {
    let (line, rest) = match s.find('\n') {
        Some(idx) => (&s[..idx], &s[idx + 1..]),
        None => (s, ""),
    };
    (line.strip_suffix('\r').unwrap_or(line), rest)
}

/// 构造简单应答（200 OK 等），Content-Length 为 0
pub fn build_response(request: &SipRequest, status_code: u16, reason_phrase: &str) -> Vec<u8> {
    SipResponse::reply_to(request, status_code, reason_phrase).to_bytes()
}

/// RFC 1123 格式的 Date 头部值
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// TCP 连接上单条报文（头部 + 消息体）的上限
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// 在 TCP 字节流中定位第一条完整报文的长度，数据不足时返回 `Ok(None)`
///
/// Content-Length 无法解析或报文超过 [`MAX_FRAME_LEN`] 时返回错误，调用方应关闭连接。
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    if buf.starts_with(b"\r\n") {
        // 设备的 CRLF 保活
        return Ok(Some(2));
    }

    let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let header_end = pos + 4;
    let head = String::from_utf8_lossy(&buf[..header_end]);

    let content_length = match head
        .split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| is_content_length(name.trim()))
    {
        Some((_, value)) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength(value.trim().to_string()))?,
        None => 0,
    };

    let total = header_end
        .checked_add(content_length)
        .filter(|total| *total <= MAX_FRAME_LEN)
        .ok_or(ParseError::FrameTooLarge {
            content_length,
            max: MAX_FRAME_LEN,
        })?;
    Ok((buf.len() >= total).then_some(total))
}

/// 从 From/To/Contact 头部提取 SIP URI（去掉尖括号和头部参数）
pub fn extract_uri(value: &str) -> Option<&str> {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        let end = value[start + 1..].find('>')?;
        return Some(&value[start + 1..start + 1 + end]);
    }
    let uri = value.split(';').next()?.trim();
    (!uri.is_empty()).then_some(uri)
}

/// 提取 `sip:<user>@` 中的用户部分（GB28181 中即设备编码）
pub fn extract_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find('@')?;
    let user = &rest[..end];
    (!user.is_empty()).then_some(user)
}

/// 提取 URI 中的 host:port，端口缺省 5060
pub fn extract_host_port(value: &str) -> Option<(String, u16)> {
    let uri = extract_uri(value)?;
    let after_scheme = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    let host_part = match after_scheme.find('@') {
        Some(at) => &after_scheme[at + 1..],
        None => after_scheme,
    };
    let host_port = host_part
        .split([';', '?', ' ', '>'])
        .next()
        .unwrap_or_default();
    if host_port.is_empty() {
        return None;
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        _ => Some((host_port.to_string(), 5060)),
    }
}

/// 读取头部参数（如 `tag=`、`expires=`）
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|part| {
        let (key, val) = part.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_end_matches('>'))
    })
}

/// 解析 CSeq 头部（序号 + 方法）
pub fn parse_cseq(value: &str) -> Option<(u32, SipMethod)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse::<u32>().ok()?;
    let method = SipMethod::from(parts.next()?);
    Some((seq, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.50:5060;rport;branch=z9hG4bK1234\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=918273\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: 12345@192.168.1.50\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:34020000001320000001@192.168.1.50:5060>\r\n\
        Max-Forwards: 70\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\
        \r\n";

    fn parse_request(raw: &str) -> SipRequest {
        match SipMessage::parse(raw.as_bytes()).unwrap() {
            SipMessage::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_sip_request_parsing() {
        let req = parse_request(REGISTER);

        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.uri, "sip:34020000002000000001@3402000000");
        assert_eq!(req.version, "SIP/2.0");
        assert_eq!(req.headers.len(), 9);
        assert_eq!(req.header("Expires"), Some("3600"));
        assert_eq!(req.call_id(), Some("12345@192.168.1.50"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_header_keys_are_case_sensitive() {
        let req = parse_request(REGISTER);
        assert!(req.header("call-id").is_none());
        assert!(req.header("Call-ID").is_some());
    }

    #[test]
    fn test_folded_header_is_joined() {
        let raw = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
            Subject: first\r\n\
            \x20 second\r\n\
            \tthird\r\n\
            CSeq: 20 MESSAGE\r\n\
            \r\n";
        let req = parse_request(raw);
        assert_eq!(req.header("Subject"), Some("first second third"));
        assert_eq!(req.header("CSeq"), Some("20 MESSAGE"));
    }

    #[test]
    fn test_body_consumed_to_end_of_input() {
        let raw = "MESSAGE sip:a@b SIP/2.0\r\n\
            Content-Length: 4\r\n\
            \r\n\
            <Notify><CmdType>Keepalive</CmdType></Notify>";
        let req = parse_request(raw);
        assert_eq!(req.body, "<Notify><CmdType>Keepalive</CmdType></Notify>");
    }

    #[test]
    fn test_malformed_request_line() {
        let err = SipMessage::parse(b"REGISTER sip:foo\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequestLine(_)));

        let err = SipMessage::parse(b"garbage").unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequestLine(_)));
    }

    #[test]
    fn test_malformed_header() {
        let raw = b"OPTIONS sip:a@b SIP/2.0\r\nVia SIP/2.0/UDP 1.2.3.4\r\n\r\n";
        let err = SipMessage::parse(raw).unwrap_err();
        assert_eq!(
            err,
            ParseError::MalformedHeader("Via SIP/2.0/UDP 1.2.3.4".to_string())
        );

        let raw = b"OPTIONS sip:a@b SIP/2.0\r\n continuation\r\n\r\n";
        assert!(matches!(
            SipMessage::parse(raw),
            Err(ParseError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_empty_and_keepalive_input() {
        assert_eq!(SipMessage::parse(b""), Err(ParseError::Empty));
        assert_eq!(SipMessage::parse(b"\r\n\r\n"), Err(ParseError::Empty));
    }

    #[test]
    fn test_garbage_bytes_never_panic() {
        let samples: [&[u8]; 5] = [
            &[0xff, 0xfe, 0x00, 0x01],
            b"SIP/2.0 abc OK\r\n\r\n",
            b"SIP/2.0 99 Low\r\n\r\n",
            b":::\r\n",
            b"INVITE  SIP/2.0\r\n",
        ];
        for sample in samples {
            assert!(SipMessage::parse(sample).is_err());
        }
    }

    #[test]
    fn test_sip_response_parsing() {
        let raw = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK1\r\n\
            To: <sip:34020000001320000001@3402000000>;tag=tag123\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Type: APPLICATION/SDP\r\n\
            \r\n\
            v=0\r\n";
        let resp = match SipMessage::parse(raw.as_bytes()).unwrap() {
            SipMessage::Response(resp) => resp,
            other => panic!("expected response, got {:?}", other),
        };
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.reason_phrase, "OK");
        assert!(resp.is_success());
        assert_eq!(resp.body, "v=0\r\n");
        assert_eq!(
            parse_cseq(resp.header("CSeq").unwrap()),
            Some((1, SipMethod::Invite))
        );
        assert_eq!(header_param(resp.header("To").unwrap(), "tag"), Some("tag123"));
    }

    #[test]
    fn test_round_trip() {
        let mut req = SipRequest::new(
            SipMethod::Message,
            "sip:34020000001320000001@192.168.1.50:5060",
        );
        req.add_header("Via", "SIP/2.0/UDP 192.168.1.10:5060;rport;branch=z9hG4bK77");
        req.add_header("From", "<sip:34020000002000000001@3402000000>;tag=42");
        req.add_header("To", "<sip:34020000001320000001@3402000000>");
        req.add_header("Call-ID", "abc@192.168.1.10");
        req.add_header("CSeq", "7 MESSAGE");
        req.add_header("Content-Type", "Application/MANSCDP+xml");
        req.set_body("<Query>\r\n<CmdType>Catalog</CmdType>\r\n</Query>");

        let parsed = parse_request(&req.to_string());

        assert_eq!(parsed.method, req.method);
        assert_eq!(parsed.uri, req.uri);
        assert_eq!(parsed.body, req.body);
        for (key, value) in req.headers.iter() {
            assert_eq!(parsed.header(key), Some(value), "header {}", key);
        }
        assert_eq!(
            parsed.header("Content-Length"),
            Some(req.body.len().to_string().as_str())
        );
    }

    #[test]
    fn test_content_length_rewritten() {
        let mut req = SipRequest::new(SipMethod::Message, "sip:a@b");
        req.add_header("Content-Length", "999");
        req.add_header("CSeq", "1 MESSAGE");
        req.set_body("hello");

        let text = req.to_string();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_build_response_echoes_transaction_headers() {
        let req = parse_request(REGISTER);
        let bytes = build_response(&req, 200, "OK");
        let resp = match SipMessage::parse(&bytes).unwrap() {
            SipMessage::Response(resp) => resp,
            other => panic!("expected response, got {:?}", other),
        };

        assert_eq!(resp.status_code, 200);
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            assert_eq!(resp.header(key), req.header(key), "header {}", key);
        }
        assert!(resp.header("Date").unwrap().ends_with("GMT"));
        assert_eq!(resp.header("Content-Length"), Some("0"));
        assert!(resp.header("Contact").is_none());
    }

    #[test]
    fn test_frame_length() {
        let msg = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = msg.as_bytes().to_vec();
        assert_eq!(frame_length(&stream).unwrap(), Some(msg.len()));

        stream.extend_from_slice(b"OPTIONS sip:a@b SIP/2.0\r\n");
        assert_eq!(frame_length(&stream).unwrap(), Some(msg.len()));
        assert_eq!(frame_length(&stream[msg.len()..]).unwrap(), None);

        assert_eq!(frame_length(&msg.as_bytes()[..msg.len() - 1]).unwrap(), None);
        assert_eq!(frame_length(b"\r\nREGISTER").unwrap(), Some(2));
    }

    #[test]
    fn test_frame_length_rejects_oversized_content_length() {
        let huge = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(
            frame_length(huge),
            Err(ParseError::FrameTooLarge { .. })
        ));

        let over = format!(
            "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: {}\r\n\r\n",
            MAX_FRAME_LEN
        );
        assert!(matches!(
            frame_length(over.as_bytes()),
            Err(ParseError::FrameTooLarge { .. })
        ));

        let bad = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: -1\r\n\r\n";
        assert!(matches!(
            frame_length(bad),
            Err(ParseError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn test_header_helpers() {
        let from = "<sip:34020000001320000001@3402000000>;tag=918273";
        assert_eq!(extract_user(from), Some("34020000001320000001"));
        assert_eq!(extract_uri(from), Some("sip:34020000001320000001@3402000000"));
        assert_eq!(header_param(from, "tag"), Some("918273"));
        assert_eq!(header_param(from, "expires"), None);

        let contact = "<sip:34020000001320000001@192.168.1.50:5062;transport=udp>;expires=120";
        assert_eq!(
            extract_host_port(contact),
            Some(("192.168.1.50".to_string(), 5062))
        );
        assert_eq!(header_param(contact, "expires"), Some("120"));

        assert_eq!(
            extract_host_port("<sip:34020000001320000001@10.0.0.8>"),
            Some(("10.0.0.8".to_string(), 5060))
        );
        assert_eq!(extract_user("<sip:3402000000>"), None);
        assert_eq!(parse_cseq("3 BYE"), Some((3, SipMethod::Bye)));
        assert_eq!(parse_cseq("BYE"), None);
    }
}
