use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use magicsniff_core::{scan_and_write, Magic, MagicError, Options, OutputMode, RuleSet, ScanOptions};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "magicsniff", version, about = "基于魔数规则的文件类型识别")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// 数据库与识别选项（各子命令共用）
#[derive(Args, Debug, Clone, Default)]
struct DbArgs {
    /// 规则数据库（文件或目录），可重复指定，按顺序取第一个存在的
    #[arg(short = 'm', long = "database")]
    database: Vec<PathBuf>,

    /// 选项配置文件（TOML）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 跟随符号链接
    #[arg(short = 'L', long = "dereference")]
    dereference: bool,

    /// 最多读取的字节数
    #[arg(long)]
    max_buffer: Option<usize>,

    /// 字符串类规则全部忽略大小写
    #[arg(short = 'i', long = "ignore-case")]
    ignore_case: bool,

    /// 首条命中后继续尝试其余规则
    #[arg(short = 'k', long = "keep-going")]
    keep_going: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 识别一个或多个文件
    Identify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// 输出 MIME 类型与编码
        #[arg(long, conflicts_with_all = ["mime_type", "mime_encoding", "extension"])]
        mime: bool,

        /// 只输出 MIME 类型
        #[arg(long, conflicts_with_all = ["mime_encoding", "extension"])]
        mime_type: bool,

        /// 只输出 MIME 编码
        #[arg(long, conflicts_with = "extension")]
        mime_encoding: bool,

        /// 输出常见扩展名
        #[arg(long)]
        extension: bool,

        /// 不输出文件名前缀
        #[arg(short = 'b', long)]
        brief: bool,

        #[command(flatten)]
        db: DbArgs,
    },
    /// 扫描目录并将识别结果写为 JSON 数组
    Scan {
        /// 输入目录
        #[arg(long)]
        input: PathBuf,

        /// 输出文件（JSON 数组）
        #[arg(long, default_value = "./result.json")]
        output: PathBuf,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 目录遍历最大深度
        #[arg(long)]
        max_depth: Option<usize>,

        #[command(flatten)]
        db: DbArgs,
    },
    /// 将文本规则编译为二进制数据库
    Compile {
        /// 规则文件或目录
        #[arg(long)]
        rules: PathBuf,

        /// 输出文件（建议使用 .msdb 扩展名）
        #[arg(long)]
        output: PathBuf,
    },
    /// 加载数据库并报告规则统计与非法规则
    Check {
        /// 规则数据库（文件或目录）；缺省使用搜索列表
        #[arg(short = 'm', long = "database")]
        database: Option<PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { files, mime, mime_type, mime_encoding, extension, brief, db } => {
            let mode = if mime {
                OutputMode::Mime
            } else if mime_type {
                OutputMode::MimeType
            } else if mime_encoding {
                OutputMode::MimeEncoding
            } else if extension {
                OutputMode::Extension
            } else {
                OutputMode::Description
            };
            let magic = open_magic(&db)?;
            let stdout = std::io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let mut failed = 0usize;
            for path in &files {
                let shown = path.display();
                match magic.identify_file(path, mode) {
                    Ok(result) if brief => writeln!(out, "{result}")?,
                    Ok(result) => writeln!(out, "{shown}: {result}")?,
                    Err(e) => {
                        failed += 1;
                        writeln!(out, "{shown}: cannot open ({e})")?;
                    }
                }
            }
            out.flush()?;
            if failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Scan { input, output, threads, max_depth, db } => {
            info!(?input, ?output, "starting scan");
            let magic = open_magic(&db)?;

            // 以缓冲方式打开输出文件，按 JSON 数组流式写入
            let mut out = BufWriter::new(File::create(&output).context("create output file")?);
            let opts = ScanOptions { threads: parse_threads(&threads), max_depth };
            let stats = scan_and_write(&input, &mut out, &magic, &opts).context("scan and write failed")?;
            out.flush().context("flush output file")?;

            info!(
                files_scanned = stats.files_scanned,
                files_failed = stats.files_failed,
                outputs_written = stats.outputs_written,
                "scan finished"
            );
            if stats.files_failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Compile { rules, output } => {
            let set = RuleSet::load(&rules).with_context(|| format!("load rules from {}", rules.display()))?;
            for d in set.diagnostics() {
                warn!(rule = d.index, reason = %d.reason, "invalid rule kept as non-matching");
            }
            let mut out = BufWriter::new(File::create(&output).context("create output file")?);
            set.compile_to(&mut out).context("write compiled database")?;
            out.flush().context("flush output file")?;
            info!(rules = set.len(), output = %output.display(), "compiled database");
        }
        Commands::Check { database } => {
            let (origin, set) = match database {
                Some(path) => {
                    let set = RuleSet::load(&path).with_context(|| format!("load {}", path.display()))?;
                    (path.display().to_string(), set)
                }
                None => {
                    let (path, set) = RuleSet::search(&[]).context("search magic database")?;
                    (path.display().to_string(), set)
                }
            };
            let diagnostics = set.diagnostics();
            println!("{origin}: {} rules, {} top-level entries", set.len(), set.top_level_count());
            let names = set.named_sets();
            if !names.is_empty() {
                println!("named rule sets: {}", names.join(", "));
            }
            for d in &diagnostics {
                println!("rule #{}: {}", d.index, d.reason);
            }
            if !diagnostics.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// 组装选项并打开数据库；未显式指定且搜索不到数据库时退回内置规则
fn open_magic(db: &DbArgs) -> Result<Magic> {
    let mut options = match &db.config {
        Some(path) => Options::from_toml_file(path).with_context(|| format!("load config {}", path.display()))?,
        None => Options::default(),
    };
    if !db.database.is_empty() {
        options.database_paths = db.database.clone();
    }
    if db.dereference {
        options.follow_symlinks = true;
    }
    if let Some(n) = db.max_buffer {
        options.max_buffer = n;
    }
    options.case_insensitive |= db.ignore_case;
    options.keep_going |= db.keep_going;

    let explicit = !options.database_paths.is_empty();
    match Magic::open(options.clone()) {
        Ok(magic) => Ok(magic),
        Err(MagicError::NotFound { searched }) if !explicit => {
            info!(searched = searched.len(), "no magic database found, using builtin rules");
            Magic::builtin(options).context("load builtin rules")
        }
        Err(e) => Err(e).context("open magic database"),
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 日志写到 stderr，避免混入识别结果
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(std::io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
