use anyhow::{Context, Result};

/// 配置模板内容
pub const PROXY_TEMPLATE: &str = include_str!("../../templates/proxy.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, PROXY_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated proxy configuration template: {}", path);
    } else {
        println!("{}", PROXY_TEMPLATE);
    }

    Ok(())
}
