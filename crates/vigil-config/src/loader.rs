use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::{GlobalConfig, ProtocolConfig};

const DEFAULT_ENV_PREFIX: &str = "VIGIL";
const ENV_SEPARATOR: &str = "__";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// 配置加载器
///
/// 优先级：环境变量 > 配置文件 > 默认值。
/// 全局配置的环境变量形如 `VIGIL__HTTP__BIND`，
/// 协议配置形如 `VIGIL_GB28181__SERVER__SIP_PORT`。
pub struct ConfigLoader {
    config_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// 替换环境变量前缀
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 加载全局配置；文件不存在时使用默认配置
    pub fn load_global(&self) -> Result<GlobalConfig> {
        let config_path = self.config_dir.join("global.toml");

        let mut builder = Config::builder().add_source(Config::try_from(&GlobalConfig::default())?);
        if config_path.exists() {
            builder = builder.add_source(File::new(path_str(&config_path)?, FileFormat::Toml));
        }
        let config = builder.add_source(self.environment(&self.env_prefix)).build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载协议配置（protocols/<name>.toml）
    pub fn load_protocol<T>(&self, protocol_name: &str) -> Result<ProtocolConfig<T>>
    where
        T: DeserializeOwned,
    {
        let config_path = self
            .config_dir
            .join("protocols")
            .join(format!("{}.toml", protocol_name));

        if !config_path.exists() {
            return Err(anyhow!("Protocol config not found: {}", protocol_name));
        }

        let prefix = format!("{}_{}", self.env_prefix, protocol_name.to_ascii_uppercase());
        let config = Config::builder()
            .add_source(File::new(path_str(&config_path)?, FileFormat::Toml))
            .add_source(self.environment(&prefix))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 协议配置，文件缺失时回退到默认服务器配置
    pub fn load_protocol_or_default<T>(&self, protocol_name: &str) -> Result<ProtocolConfig<T>>
    where
        T: DeserializeOwned + Default,
    {
        let config_path = self
            .config_dir
            .join("protocols")
            .join(format!("{}.toml", protocol_name));
        if config_path.exists() {
            self.load_protocol(protocol_name)
        } else {
            Ok(ProtocolConfig {
                server: T::default(),
            })
        }
    }

    /// 验证全局配置
    pub fn validate(&self) -> Result<()> {
        let global = self.load_global()?;

        global
            .http
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid http.bind {:?}: {}", global.http.bind, e))?;

        let level = global.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(anyhow!("invalid logging.level {:?}", global.logging.level));
        }

        Ok(())
    }

    /// 序列化为 TOML 文本（用于打印生效配置）
    pub fn render<T: Serialize>(value: &T) -> Result<String> {
        Ok(toml::to_string_pretty(value)?)
    }

    fn environment(&self, prefix: &str) -> Environment {
        Environment::with_prefix(prefix)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| anyhow!("Invalid config path"))
}
