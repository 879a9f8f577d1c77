use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::{ProxyConfig, ProxyMode};
use crate::proxy::Proxy;
use crate::tls;

use super::cert;
use super::config::{check_config, expand_path};
use super::template;

/// Execute CLI commands
pub fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config, mode } => {
            run_proxy(config, *mode)?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// 加载配置并在 TLS 相关模式下准备证书
pub fn prepare(
    config: &str,
    mode: Option<ProxyMode>,
) -> Result<(ProxyConfig, Option<Arc<rustls::ServerConfig>>)> {
    let config_path = expand_path(config)?;

    info!("Loading proxy configuration from: {}", config_path);
    let mut proxy_config = ProxyConfig::load(&config_path)?;

    if let Some(mode) = mode {
        info!("Overriding proxy mode: {} -> {}", proxy_config.mode, mode);
        proxy_config.mode = mode;
        proxy_config.validate()?;
    }

    let tls_config = if proxy_config.tls_enabled() {
        let (cert_path, key_path) = cert::ensure_server_certs(&proxy_config)?;
        Some(tls::load_server_config(&cert_path, &key_path)?)
    } else {
        None
    };

    Ok((proxy_config, tls_config))
}

/// Run the proxy until the process is stopped
fn run_proxy(config: &str, mode: Option<ProxyMode>) -> Result<()> {
    let (proxy_config, tls_config) = prepare(config, mode)?;

    let mut proxy = Proxy::bind(&proxy_config, tls_config).context("Failed to start proxy")?;
    proxy.run()?;

    Ok(())
}
