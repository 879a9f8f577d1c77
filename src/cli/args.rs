use clap::{ArgAction, Parser, Subcommand};

use crate::config::ProxyMode;

#[derive(Parser, Debug)]
#[command(name = "tls-edge-proxy")]
#[command(author, version, about = "Non-blocking TCP proxy with TLS termination and protocol detection", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,

        /// 覆盖配置文件中的工作模式 (plain, tls, auto)
        #[arg(short, long)]
        mode: Option<ProxyMode>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 输出文件路径，不指定则打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
