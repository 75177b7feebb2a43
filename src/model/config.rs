//! 运行时配置
//!
//! 配置全部来自命令行参数，不读配置文件；默认值集中在 default_* 函数。

use std::path::PathBuf;

/// tap 应用配置
#[derive(Debug, Clone)]
pub struct Config {
    /// 监听地址（只绑定回环）
    pub host: String,
    /// 代理监听端口（0 表示自动分配）
    pub port: u16,
    /// 上游 API 基地址
    pub target: String,
    /// 追踪输出目录
    pub output_dir: PathBuf,
    /// 是否启动实时查看服务
    pub live: bool,
    /// 实时查看服务端口（0 表示自动分配）
    pub live_port: u16,
    /// 输出目录保留的最大会话数（0 表示不限制）
    pub max_traces: usize,
    /// 只起代理，不启动子进程
    pub no_launch: bool,
    /// 透传给 claude 的其余参数
    pub claude_args: Vec<String>,
}

pub fn default_host() -> String {
    "127.0.0.1".to_string()
}

pub fn default_target() -> String {
    "https://api.anthropic.com".to_string()
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./.traces")
}

pub fn default_max_traces() -> usize {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            target: default_target(),
            output_dir: default_output_dir(),
            live: false,
            live_port: 0,
            max_traces: default_max_traces(),
            no_launch: false,
            claude_args: Vec::new(),
        }
    }
}

impl Config {
    /// 上游基地址去掉尾部斜杠，避免拼接出双斜杠路径
    pub fn normalized_target(&self) -> String {
        self.target.trim_end_matches('/').to_string()
    }
}
