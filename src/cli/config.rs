use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{ProxyConfig, ProxyMode};

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置有效但值得提醒的问题
fn collect_warnings(config: &ProxyConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            if !cert.exists() {
                warnings.push(format!("Certificate file not found: {:?}", cert));
            }
            if !key.exists() {
                warnings.push(format!("Key file not found: {:?}", key));
            }
            if config.mode == ProxyMode::Plain {
                warnings.push("Certificate is configured but plain mode never uses it".to_string());
            }
        }
        _ if config.tls_enabled() => {
            warnings.push("No certificate configured, a self-signed one will be generated at startup".to_string());
        }
        _ => {}
    }

    if config.mode == ProxyMode::Auto && config.strict_protocol {
        warnings.push("strict_protocol has no effect in auto mode".to_string());
    }

    warnings
}

fn details(config: &ProxyConfig) -> serde_json::Value {
    let mut details = serde_json::json!({
        "listen": format!("{}:{}", config.listen_addr, config.listen_port),
        "backend": format!("{}:{}", config.backend_addr, config.backend_port),
        "mode": config.mode,
        "strict_protocol": config.strict_protocol,
        "handshake_timeout_secs": config.handshake_timeout_secs,
        "backlog": config.backlog,
        "max_events": config.max_events,
        "tcp_nodelay": config.tcp_nodelay,
    });

    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            details["cert_path"] = serde_json::json!(cert);
            details["key_path"] = serde_json::json!(key);
        }
        _ if config.tls_enabled() => {
            details["cert_mode"] = serde_json::json!("auto-generate");
        }
        _ => {}
    }

    details
}

fn print_failure(format: &str, message: &str) -> Result<()> {
    if format == "json" {
        let result = CheckResult {
            valid: false,
            warnings: vec![],
            error: Some(message.to_string()),
            details: serde_json::json!({}),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("✗ {}", message);
    }
    Ok(())
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    // Check if file exists
    if !path.exists() {
        let message = format!("Configuration file not found: {}", config_path);
        print_failure(format, &message)?;
        anyhow::bail!(message);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config = match ProxyConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            print_failure(format, &format!("{:#}", e))?;
            if format == "text" {
                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure the [proxy] section has listen_port and backend_port");
                println!("  3. Ensure port numbers are valid (1-65535)");
                println!("  4. mode must be one of: plain, tls, auto");
                println!("  5. Set both cert_path and key_path, or omit both to auto-generate");
            }
            return Err(e);
        }
    };

    let warnings = collect_warnings(&config);

    if format == "json" {
        let result = CheckResult {
            valid: true,
            warnings,
            error: None,
            details: details(&config),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("✓ Listen address: {}:{}", config.listen_addr, config.listen_port);
    println!("✓ Backend address: {}:{}", config.backend_addr, config.backend_port);
    println!("✓ Mode: {}", config.mode);
    if config.strict_protocol {
        println!("✓ Strict protocol checking enabled");
    }
    match config.handshake_timeout_secs {
        Some(secs) => println!("✓ Handshake timeout: {}s", secs),
        None => println!("✓ Handshake timeout: disabled"),
    }
    if let (Some(cert), Some(key)) = (&config.cert_path, &config.key_path) {
        println!("✓ Certificate path: {:?}", cert);
        println!("✓ Key path: {:?}", key);
    }
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Proxy configuration is valid!");

    Ok(())
}
