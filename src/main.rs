use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use litscreen::app::{App, RunRequest};
use litscreen::utils::logging;
use litscreen::Config;

#[derive(Parser, Debug)]
#[command(name = "litscreen")]
#[command(about = "用 LLM 批量分析文献条目，支持缓存和断点续跑", long_about = None)]
#[command(version)]
struct Args {
    /// `[[items]]` 格式的 TOML 输入文件
    input: PathBuf,

    /// 结果 JSON 文件，检查点文件放在它旁边
    output: PathBuf,

    /// 用户提示词模板文件，`{字段名}` 会被替换
    prompt: PathBuf,

    /// 系统提示词文件
    #[arg(long, value_name = "FILE")]
    system: Option<PathBuf>,

    /// 配置文件（TOML），环境变量会覆盖其中的值
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 忽略已有检查点，从头开始
    #[arg(long)]
    fresh: bool,
}

impl Args {
    fn run_request(&self) -> RunRequest {
        RunRequest {
            input: self.input.clone(),
            output: self.output.clone(),
            prompt: self.prompt.clone(),
            system_prompt: self.system.clone(),
            resume: !self.fresh,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 加载配置
    let config = Config::load(args.config.as_deref())?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let app = App::initialize(config).await?;
    app.run(&args.run_request()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_positional_paths_and_flags() {
        let args = Args::try_parse_from([
            "litscreen",
            "items.toml",
            "out.json",
            "prompt.txt",
            "--system",
            "system.txt",
            "--fresh",
        ])
        .unwrap();

        let request = args.run_request();
        assert_eq!(request.input, PathBuf::from("items.toml"));
        assert_eq!(request.output, PathBuf::from("out.json"));
        assert_eq!(request.prompt, PathBuf::from("prompt.txt"));
        assert_eq!(request.system_prompt, Some(PathBuf::from("system.txt")));
        assert!(!request.resume);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_resume_is_default() {
        let args = Args::try_parse_from(["litscreen", "a.toml", "b.json", "c.txt"]).unwrap();
        assert!(args.run_request().resume);
    }

    #[test]
    fn test_flag_without_value_is_rejected() {
        let err = Args::try_parse_from(["litscreen", "a.toml", "b.json", "c.txt", "--system"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = Args::try_parse_from(["litscreen", "a.toml", "b.json", "c.txt", "--frsh"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_missing_positional_is_rejected() {
        let err = Args::try_parse_from(["litscreen", "a.toml"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
