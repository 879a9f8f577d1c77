use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// 加载服务器 TLS 配置
///
/// 证书链和私钥均为 PEM 格式；返回的配置在所有连接之间共享，只读
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    // 加载证书
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open cert file: {:?}", cert_path))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", cert_path);
    }

    // 加载私钥
    let key_file =
        File::open(key_path).with_context(|| format!("Failed to open key file: {:?}", key_path))?;
    let mut key_reader = BufReader::new(key_file);

    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("Failed to parse private key")?
        .context("No private key found")?;

    // 创建 TLS 配置
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create server config")?;

    Ok(Arc::new(config))
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    // rcgen 0.14 returns CertifiedKey; cert field carries der, signing_key holds private key
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}
