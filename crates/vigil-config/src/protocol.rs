use serde::{Deserialize, Serialize};

/// 协议配置（泛型，承载具体协议的服务器配置）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig<T> {
    pub server: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Deserialize, Serialize)]
    struct TestServerConfig {
        bind: String,
    }

    #[test]
    fn test_protocol_config() {
        let config: ProtocolConfig<TestServerConfig> =
            toml::from_str("[server]\nbind = \"0.0.0.0:5060\"\n").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:5060");
    }
}
