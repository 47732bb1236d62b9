// Recoup - PostgreSQL 时间点恢复备份引擎
//
// 主程序入口，负责命令行参数解析和备份流程协调
//
// 功能特性：
// - 全量备份：复制整个集群数据目录
// - 页级差异备份：扫描归档 WAL，仅复制变更过的数据块
// - 归档协调：备份括号内强制切段并等待归档确认
// - 目录管理：描述符、互斥锁和保留策略
// - 配置文件管理：按名称保存和引用集群配置

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use recoup::backup::BackupOrchestrator;
use recoup::catalog::BackupMode;
use recoup::config::BackupConfig;
use recoup::pagemap::XlogDumpScanner;
use recoup::server::PsqlConnection;
use recoup::store::AppConfig;
use recoup::utils::{format_bytes, format_duration, InterruptFlag};
use std::path::PathBuf;

/// 备份模式的命令行表示
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    /// 全量备份
    Full,
    /// 页级差异备份
    Page,
}

impl From<ModeArg> for BackupMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => BackupMode::Full,
            ModeArg::Page => BackupMode::DifferentialPage,
        }
    }
}

/// 子命令枚举
#[derive(Subcommand, Debug)]
enum Commands {
    /// 清理超出保留策略的旧备份
    Prune {
        /// 备份目录根。未提供时从 --profile 推断
        #[arg(short = 'B', long)]
        backup_path: Option<PathBuf>,
    },
}

/// 命令行参数结构体
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,

    /// 集群数据目录（$PGDATA）
    #[arg(short = 'D', long)]
    pgdata: Option<PathBuf>,

    /// 备份目录根
    #[arg(short = 'B', long)]
    backup_path: Option<PathBuf>,

    /// WAL 归档目录
    #[arg(short = 'A', long)]
    arclog_path: Option<PathBuf>,

    /// 备份模式
    #[arg(short = 'b', long, value_enum, default_value_t = ModeArg::Full)]
    mode: ModeArg,

    /// 服务器连接字符串（如 postgresql://localhost/postgres）
    #[arg(short = 'd', long)]
    conninfo: Option<String>,

    /// 平滑检查点（把检查点 I/O 摊开而不是立即强制）
    #[arg(long)]
    smooth_checkpoint: bool,

    /// 备份完成后保留的完成全量备份代数
    #[arg(long, global = true)]
    keep_generations: Option<usize>,

    /// 备份完成后保留的天数
    #[arg(long, global = true)]
    keep_days: Option<i64>,

    /// 排除模式（Glob 风格）
    #[arg(long)]
    exclude: Vec<String>,

    /// 使用保存的集群配置文件（Profile）
    #[arg(short = 'p', long, global = true)]
    profile: Option<String>,

    /// 试运行模式（不实际复制文件）
    #[arg(long, global = true)]
    dry_run: bool,

    /// 逐文件打印进度
    #[arg(long)]
    verbose: bool,
}

/// 程序入口
fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Some(Commands::Prune { backup_path }) => {
            // 处理清理命令：路径和策略可来自参数或配置文件
            let profile = load_profile(&args)?;
            let path = backup_path
                .clone()
                .or_else(|| profile.as_ref().map(|p| p.backup_path.clone()))
                .context("Backup path is required for prune command")?;
            let generations = args
                .keep_generations
                .or(profile.as_ref().and_then(|p| p.keep_generations));
            let days = args.keep_days.or(profile.as_ref().and_then(|p| p.keep_days));

            recoup::prune::prune_backups(&path, generations, days, args.dry_run)?;
        }
        None => {
            run_backup(args)?;
        }
    }
    Ok(())
}

/// 加载 --profile 指定的集群配置
fn load_profile(args: &Args) -> Result<Option<recoup::store::Profile>> {
    match &args.profile {
        Some(name) => {
            let app_config = AppConfig::load()?;
            let profile = app_config
                .profiles
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("Profile '{}' not found", name))?;
            Ok(Some(profile))
        }
        None => Ok(None),
    }
}

/// 执行备份操作
fn run_backup(args: Args) -> Result<()> {
    // 准备备份配置：命令行参数优先，其次是配置文件
    let config = if let (Some(pgdata), Some(backup_path), Some(arclog_path)) =
        (&args.pgdata, &args.backup_path, &args.arclog_path)
    {
        BackupConfig {
            pgdata: pgdata.clone(),
            backup_path: backup_path.clone(),
            arclog_path: arclog_path.clone(),
            mode: args.mode.into(),
            conninfo: args.conninfo.clone(),
            smooth_checkpoint: args.smooth_checkpoint,
            keep_generations: args.keep_generations,
            keep_days: args.keep_days,
            exclude_patterns: args.exclude.clone(),
            dry_run: args.dry_run,
            verbose: args.verbose,
        }
        .validate()?
    } else if let Some(profile) = load_profile(&args)? {
        BackupConfig::from_profile(&profile, args.mode.into(), args.dry_run, args.verbose)?
    } else {
        return Err(anyhow!(
            "PGDATA, backup path and arclog path are required (or use --profile)"
        ));
    };

    let start_time = std::time::Instant::now();

    // 打印备份信息
    println!(
        "{}",
        style(format!("Recoup Backup Engine v{}", env!("CARGO_PKG_VERSION")))
            .cyan()
            .bold()
    );
    println!("PGDATA: {:?}", style(&config.pgdata).blue());
    println!("Dest:   {:?}", style(&config.backup_path).blue());
    println!(
        "Mode:   {}",
        style(match config.mode {
            BackupMode::Full => "full",
            BackupMode::DifferentialPage => "page differential",
        })
        .yellow()
    );
    println!("{}", style("----------------------------------------").dim());

    // 创建备份目录根（如果不存在）
    if !config.backup_path.exists() {
        if !config.dry_run {
            std::fs::create_dir_all(&config.backup_path)
                .context("Failed to create backup root")?;
        } else {
            println!(
                "{} Would create backup root {:?}",
                style("Dry run:").yellow(),
                config.backup_path
            );
        }
    }

    let mut server = PsqlConnection::new(config.conninfo.clone(), config.pgdata.clone());
    let mut wal_scanner = XlogDumpScanner;
    let interrupt = InterruptFlag::new();

    // 终止信号走协作式中断，保证服务端的备份括号被关闭
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || handler_flag.raise())
        .context("Failed to install interrupt handler")?;

    let mut orchestrator =
        BackupOrchestrator::new(config, &mut server, &mut wal_scanner, interrupt);
    let summary = orchestrator.run()?;

    // 打印备份统计信息
    println!("{}", style("----------------------------------------").dim());
    println!("{}", style("Backup Completed Successfully!").green().bold());
    println!("Backup:       {}", summary.descriptor.folder_name());
    println!(
        "Timeline:     {} ({} .. {})",
        summary.descriptor.timeline, summary.descriptor.start_lsn, summary.descriptor.stop_lsn
    );
    println!("Total Files:  {}", summary.total_files);
    println!("Copied:       {}", style(summary.copied_files).green());
    println!("Skipped:      {}", style(summary.skipped_files).dim());
    println!(
        "Data Size:    {}",
        style(format_bytes(summary.descriptor.data_bytes.max(0) as u64)).cyan()
    );
    println!(
        "Duration:     {}",
        style(format_duration(start_time.elapsed().as_secs())).bold()
    );

    Ok(())
}
