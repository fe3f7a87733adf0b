//! 命令行批量翻译工具
//!
//! 每行一个片段读取输入文件，翻译后按相同行序写出。

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use llm_bulk_translator::logging::init_logging;
use llm_bulk_translator::{
    Result, TranslateRequest, TranslationError, TranslationLibConfig, TranslationService,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file, one fragment per line
    input: PathBuf,

    /// Output file; prints to stdout when omitted
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Model id, e.g. gemini-2.0-flash
    #[arg(short = 'm', long, default_value = "gemini-2.0-flash")]
    model: String,

    /// Source language name
    #[arg(short = 's', long, default_value = "English")]
    source_language: String,

    /// Target language name; falls back to the config file
    #[arg(short = 't', long)]
    target_language: Option<String>,

    /// Space separated API keys; falls back to GEMINI_API_KEY
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Requests per minute allowed for the model
    #[arg(long, default_value_t = 15)]
    rpm: u32,

    /// Maximum output tokens per request
    #[arg(long, default_value_t = 8192)]
    max_output_tokens: usize,

    /// Enable extended reasoning
    #[arg(long)]
    thinking: bool,

    /// Custom prompt template file
    #[arg(long)]
    prompt: Option<PathBuf>,

    /// Path to config file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// SQLite cache database, overrides the config file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(e) = run(args).await {
        tracing::error!("翻译失败: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TranslationLibConfig::from_file(path)?,
        None => TranslationLibConfig::load_from_default_locations(),
    };
    if let Some(database) = args.database {
        config.engine.database_path = Some(database);
    }

    let api_key = args
        .api_key
        .or_else(|| std::env::var("GEMINI_API_KEY").ok())
        .ok_or_else(|| {
            TranslationError::ConfigError(
                "no API key given, use --api-key or GEMINI_API_KEY".to_string(),
            )
        })?;

    let content = fs::read_to_string(&args.input)?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    tracing::info!("读取 {} 行: {}", lines.len(), args.input.display());

    let mut request = TranslateRequest::new(lines, args.source_language, api_key);
    request.target_language = args.target_language;
    request.requests_per_minute = args.rpm;
    request.max_output_token_count = args.max_output_tokens;
    request.use_thinking = args.thinking;
    request.file_info = Some(args.input.display().to_string());
    if let Some(prompt) = &args.prompt {
        request.prompt_preset_content = Some(fs::read_to_string(prompt)?);
    }

    let service = TranslationService::new(config.engine)?;
    let translated = service.translate(&args.model, request).await?;

    let stats = service.cache().stats();
    tracing::info!(
        "缓存统计：内存命中 {}，持久层命中 {}，未命中 {}",
        stats.memory_hits,
        stats.durable_hits,
        stats.misses
    );

    let mut output = translated.join("\n");
    output.push('\n');
    match args.output {
        Some(path) => {
            fs::write(&path, output)?;
            tracing::info!("译文已写入: {}", path.display());
        }
        None => print!("{}", output),
    }
    Ok(())
}
