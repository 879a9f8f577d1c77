use anyhow::{bail, Result};
use tracing::warn;

use super::{ProxyConfig, ProxyMode};

/// 握手超时上限（一天）
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 86400;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证代理配置
    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        Self::validate_address(&config.listen_addr, "Proxy listen_addr")?;
        Self::validate_port(config.listen_port, "Proxy listen_port")?;
        Self::validate_address(&config.backend_addr, "Proxy backend_addr")?;
        Self::validate_port(config.backend_port, "Proxy backend_port")?;

        // 验证证书配置
        Self::validate_cert_pair(config)?;

        if config.backlog == 0 {
            bail!("backlog must be greater than 0");
        }
        if config.backlog < 128 {
            warn!(
                "backlog ({}) is below 128, bursts of connections may be refused",
                config.backlog
            );
        }

        if config.max_events == 0 {
            bail!("max_events must be greater than 0");
        }

        if let Some(secs) = config.handshake_timeout_secs {
            if secs == 0 {
                bail!("handshake_timeout_secs must be greater than 0 when set");
            }
            if secs > MAX_HANDSHAKE_TIMEOUT_SECS {
                bail!(
                    "handshake_timeout_secs ({}) exceeds the maximum of {}",
                    secs,
                    MAX_HANDSHAKE_TIMEOUT_SECS
                );
            }
        }

        Ok(())
    }

    /// 证书与私钥必须成对出现或同时缺省
    pub fn validate_cert_pair(config: &ProxyConfig) -> Result<()> {
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        if config.mode == ProxyMode::Plain && config.cert_path.is_some() {
            warn!("cert_path/key_path are ignored in plain mode");
        }

        Ok(())
    }
}
