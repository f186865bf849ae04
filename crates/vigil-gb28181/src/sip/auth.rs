// GB28181 注册鉴权
// MD5 Digest 挑战/应答（不带 qop），nonce 有效期 300 秒

use super::message::SipRequest;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// nonce 有效期（秒）
pub const NONCE_TTL_SECS: i64 = 300;

/// nonce 存储（值为签发时间），每次访问时顺带清理过期项
#[derive(Debug, Default)]
pub struct NonceStore {
    nonces: RwLock<HashMap<String, DateTime<Utc>>>,
    counter: AtomicU64,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 签发新 nonce
    pub async fn issue_at(&self, now: DateTime<Utc>) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
        let nonce = format!("{:x}", md5::compute(format!("{}:{}", nanos, seq)));

        let mut nonces = self.nonces.write().await;
        prune(&mut nonces, now);
        nonces.insert(nonce.clone(), now);
        nonce
    }

    /// nonce 是否由本存储签发且未过期
    pub async fn is_valid_at(&self, nonce: &str, now: DateTime<Utc>) -> bool {
        let mut nonces = self.nonces.write().await;
        prune(&mut nonces, now);
        nonces.contains_key(nonce)
    }

    pub async fn len(&self) -> usize {
        self.nonces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nonces.read().await.is_empty()
    }
}

fn prune(nonces: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
    let ttl = Duration::seconds(NONCE_TTL_SECS);
    nonces.retain(|_, issued| now.signed_duration_since(*issued) <= ttl);
}

/// Digest 鉴权器（共享密码；未配置密码时关闭鉴权）
#[derive(Debug)]
pub struct DigestAuthenticator {
    realm: String,
    password: Option<String>,
    nonces: NonceStore,
}

impl DigestAuthenticator {
    pub fn new(realm: impl Into<String>, password: Option<String>) -> Self {
        Self {
            realm: realm.into(),
            password: password.filter(|p| !p.is_empty()),
            nonces: NonceStore::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// 校验请求的 Authorization 头部
    pub async fn authenticate(&self, req: &SipRequest) -> bool {
        self.authenticate_at(req, Utc::now()).await
    }

    pub async fn authenticate_at(&self, req: &SipRequest, now: DateTime<Utc>) -> bool {
        let Some(password) = self.password.as_deref() else {
            return true;
        };

        let Some(header) = req.header("Authorization") else {
            tracing::debug!(target: "gb28181::sip", "no Authorization header");
            return false;
        };

        let Some(params) = parse_digest_params(header) else {
            tracing::warn!(target: "gb28181::sip", "Authorization header is not a Digest credential");
            return false;
        };

        let field = |name: &str| params.get(name).map(String::as_str);
        let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            field("username"),
            field("realm"),
            field("nonce"),
            field("uri"),
            field("response"),
        ) else {
            tracing::warn!(target: "gb28181::sip", "Digest credential is missing parameters");
            return false;
        };

        if !self.nonces.is_valid_at(nonce, now).await {
            tracing::warn!(target: "gb28181::sip", %username, "unknown or expired nonce");
            return false;
        }

        let expected =
            compute_digest_response(username, realm, password, req.method.as_str(), uri, nonce);
        expected == response
    }

    pub async fn generate_nonce(&self) -> String {
        self.nonces.issue_at(Utc::now()).await
    }

    pub async fn generate_nonce_at(&self, now: DateTime<Utc>) -> String {
        self.nonces.issue_at(now).await
    }

    /// 生成 401 挑战的 WWW-Authenticate 头部值（附带新 nonce）
    pub async fn challenge(&self) -> String {
        let nonce = self.generate_nonce().await;
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
            self.realm, nonce
        )
    }

    pub fn nonce_store(&self) -> &NonceStore {
        &self.nonces
    }
}

/// 解析 Digest Authorization / WWW-Authenticate 头部为键值对
pub fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let value = value.trim_start();
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }

    let mut map = HashMap::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut parts = Vec::new();
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&rest[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    for part in parts {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        map.insert(key.trim().to_ascii_lowercase(), val.to_string());
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 计算 HTTP Digest 响应（简化版，不使用 qop）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::SipMethod;

    const DEVICE: &str = "34020000001320000001";
    const REALM: &str = "3402000000";
    const URI: &str = "sip:34020000002000000001@3402000000";

    fn register_with(auth: Option<String>) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Register, URI);
        req.add_header("From", format!("<sip:{}@{}>;tag=1", DEVICE, REALM));
        if let Some(value) = auth {
            req.add_header("Authorization", value);
        }
        req
    }

    fn credential(nonce: &str, response: &str) -> String {
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            DEVICE, REALM, nonce, URI, response
        )
    }

    #[test]
    fn test_digest_known_answer() {
        let response = compute_digest_response(DEVICE, REALM, "12345678", "REGISTER", URI, "9e3c1f6a2b");
        assert_eq!(response, "01fba7b9442ee73b34d05c80bd81570c");
    }

    #[test]
    fn test_parse_digest_params() {
        let params = parse_digest_params(&credential("abc", "def")).unwrap();
        assert_eq!(params.get("username").unwrap(), DEVICE);
        assert_eq!(params.get("uri").unwrap(), URI);
        assert_eq!(params.get("algorithm").unwrap(), "MD5");

        let quoted = parse_digest_params(r#"Digest realm="a,b", nonce="n""#).unwrap();
        assert_eq!(quoted.get("realm").unwrap(), "a,b");

        assert!(parse_digest_params("Basic dXNlcjpwYXNz").is_none());
        assert!(parse_digest_params("Digest").is_none());
    }

    #[tokio::test]
    async fn test_disabled_without_password() {
        let auth = DigestAuthenticator::new(REALM, Some(String::new()));
        assert!(!auth.enabled());
        assert!(auth.authenticate(&register_with(None)).await);
    }

    #[tokio::test]
    async fn test_challenge_and_response() {
        let auth = DigestAuthenticator::new(REALM, Some("12345678".to_string()));
        assert!(!auth.authenticate(&register_with(None)).await);

        let challenge = auth.challenge().await;
        assert!(challenge.starts_with("Digest realm=\"3402000000\", nonce=\""));
        assert!(challenge.ends_with("algorithm=MD5"));
        let nonce = parse_digest_params(&challenge).unwrap()["nonce"].clone();

        let good = compute_digest_response(DEVICE, REALM, "12345678", "REGISTER", URI, &nonce);
        assert!(auth.authenticate(&register_with(Some(credential(&nonce, &good)))).await);

        let bad = compute_digest_response(DEVICE, REALM, "wrong", "REGISTER", URI, &nonce);
        assert!(!auth.authenticate(&register_with(Some(credential(&nonce, &bad)))).await);

        // 十六进制比较区分大小写
        let upper = good.to_uppercase();
        assert!(!auth.authenticate(&register_with(Some(credential(&nonce, &upper)))).await);
    }

    #[tokio::test]
    async fn test_unknown_nonce_rejected() {
        let auth = DigestAuthenticator::new(REALM, Some("12345678".to_string()));
        let forged = "0123456789abcdef0123456789abcdef";
        let response = compute_digest_response(DEVICE, REALM, "12345678", "REGISTER", URI, forged);
        assert!(!auth.authenticate(&register_with(Some(credential(forged, &response)))).await);
    }

    #[tokio::test]
    async fn test_expired_nonce_rejected() {
        let auth = DigestAuthenticator::new(REALM, Some("12345678".to_string()));
        let issued = Utc::now() - Duration::seconds(NONCE_TTL_SECS + 1);
        let nonce = auth.generate_nonce_at(issued).await;
        let response = compute_digest_response(DEVICE, REALM, "12345678", "REGISTER", URI, &nonce);
        let req = register_with(Some(credential(&nonce, &response)));

        assert!(auth.authenticate_at(&req, issued + Duration::seconds(10)).await);
        assert!(!auth.authenticate_at(&req, Utc::now()).await);
    }

    #[tokio::test]
    async fn test_nonce_store_prunes_on_issue() {
        let store = NonceStore::new();
        let t0 = Utc::now();
        let first = store.issue_at(t0).await;
        let second = store.issue_at(t0).await;
        assert_ne!(first, second);
        assert_eq!(store.len().await, 2);

        store.issue_at(t0 + Duration::seconds(NONCE_TTL_SECS + 1)).await;
        assert_eq!(store.len().await, 1);
    }
}
