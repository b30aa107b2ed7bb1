use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 默认的接收暂存区大小：一条最大 TLS 记录（16 KiB 明文 + 加密开销）外加余量。
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 18 * 1024;
/// 默认的发送暂存区大小。
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 18 * 1024;
/// 默认的可恢复会话缓存容量（按主机计）。
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 256;

/// 协商时允许的 TLS 协议版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    const ALL: [TlsVersion; 2] = [TlsVersion::Tls12, TlsVersion::Tls13];
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        })
    }
}

/// TLS 客户端配置记录。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集中描述协商参数（版本上下界、禁用套件、ALPN）与内存桥接的容量，
///   这些选项只影响引擎协商与缓冲大小，不改变会话状态机的控制流；
/// - 支持以 TOML 文本加载，便于与部署配置一同下发。
///
/// ## 契约（What）
/// - 缺省字段取 [`Default`] 中的值，未知字段直接拒绝；
/// - [`TlsClientConfig::validate`] 拒绝倒置的版本区间、零容量缓冲区与零容量缓存。
///
/// ## 风险与权衡（Trade-offs）
/// - `disabled_cipher_suites` 使用 IANA 数值标识，避免绑定某个 TLS 库的枚举命名；
/// - 根证书不在此处配置，而由 `TlsConnector` 的调用方以 `RootCertStore` 形式提供。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsClientConfig {
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub disabled_cipher_suites: Vec<u16>,
    pub alpn_protocols: Vec<String>,
    pub enable_resumption: bool,
    pub session_cache_capacity: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            disabled_cipher_suites: Vec::new(),
            alpn_protocols: Vec::new(),
            enable_resumption: true,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl TlsClientConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: TlsClientConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_version > self.max_version {
            return Err(ConfigError::VersionRange {
                min: self.min_version,
                max: self.max_version,
            });
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::Zero {
                field: "recv_buffer_size",
            });
        }
        if self.send_buffer_size == 0 {
            return Err(ConfigError::Zero {
                field: "send_buffer_size",
            });
        }
        if self.session_cache_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "session_cache_capacity",
            });
        }
        Ok(())
    }

    /// 按升序列出允许协商的协议版本。
    pub fn versions(&self) -> impl Iterator<Item = TlsVersion> + '_ {
        TlsVersion::ALL
            .into_iter()
            .filter(|version| *version >= self.min_version && *version <= self.max_version)
    }
}
