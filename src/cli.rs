use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    /// 要下载的 URL，可以给多个
    #[arg(short, long)]
    pub url: Vec<String>,

    /// 目标队列名，不存在时自动创建
    #[arg(short, long, default_value = "default")]
    pub queue: String,
}
