// ==========================================
// 标本导入对账系统 - 命令行入口
// ==========================================
// 命令:
// - import: 导入一组制表符分隔文件（MERGE / REPLACE）
// - init-db: 幂等建库
// - config: 读写容器配置
// - stats: 容器三层主表行数
// ==========================================

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use specimen_sync::config::{ConfigManager, GLOBAL_SCOPE};
use specimen_sync::domain::ImportMode;
use specimen_sync::importer::{SpecimenImporter, SpecimenImporterImpl};
use specimen_sync::repository::{SpecimenRepository, SpecimenRepositoryImpl};
use specimen_sync::{db, logging, perf};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "specimen-sync", version, about = "标本导入与汇总对账")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 数据库文件路径（默认: SPECIMEN_SYNC_DB_PATH 或用户数据目录）
    #[arg(long = "db", value_name = "PATH", global = true)]
    db_path: Option<String>,

    /// 日志输出格式
    #[arg(long = "log-format", value_enum, default_value = "pretty", global = true)]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Merge,
    Replace,
}

impl From<ModeArg> for ImportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Merge => ImportMode::Merge,
            ModeArg::Replace => ImportMode::Replace,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// 导入标本文件（同一次调用的全部文件在一个事务内）
    Import {
        /// 目标容器
        #[arg(long)]
        container: String,

        #[arg(long, value_enum, default_value = "merge")]
        mode: ModeArg,

        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// 建库（可重复执行）
    InitDb,

    /// 容器配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 三层主表行数
    Stats {
        #[arg(long)]
        container: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 写入配置值
    Set {
        /// 作用域（容器 ID，缺省为 global）
        #[arg(long, default_value = GLOBAL_SCOPE)]
        scope: String,
        key: String,
        value: String,
    },
    /// 查看作用域全部配置
    Show {
        #[arg(long, default_value = GLOBAL_SCOPE)]
        scope: String,
    },
}

fn open_database(db_path: &str) -> anyhow::Result<Arc<Mutex<Connection>>> {
    let mut conn = db::open_sqlite_connection(db_path)
        .with_context(|| format!("无法打开数据库: {}", db_path))?;
    perf::install_sqlite_tracing(&mut conn);
    db::init_schema(&conn).context("建库失败")?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.log_format {
        LogFormatArg::Pretty => logging::init(),
        LogFormatArg::Json => logging::init_json(),
    }

    let db_path = cli.db_path.unwrap_or_else(db::default_db_path);
    tracing::info!(version = specimen_sync::VERSION, db_path = %db_path, "{}", specimen_sync::APP_NAME);

    let conn = open_database(&db_path)?;

    match cli.command {
        Command::InitDb => {
            tracing::info!(db_path = %db_path, "数据库已就绪");
        }
        Command::Config { action } => {
            let config = ConfigManager::from_connection(conn)?;
            match action {
                ConfigAction::Set { scope, key, value } => {
                    config.set(&scope, &key, &value)?;
                    tracing::info!(scope = %scope, key = %key, value = %value, "配置已写入");
                }
                ConfigAction::Show { scope } => {
                    println!("{}", config.get_config_snapshot(&scope)?);
                }
            }
        }
        Command::Stats { container } => {
            let repo = SpecimenRepositoryImpl::from_connection(conn);
            let specimens = repo.count_specimens(&container).await?;
            let vials = repo.count_vials(&container).await?;
            let events = repo.count_events(&container).await?;
            let stats = serde_json::json!({
                "container": container,
                "specimens": specimens,
                "vials": vials,
                "events": events,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Import { container, mode, files } => {
            let config = ConfigManager::from_connection(conn.clone())?;
            let importer = SpecimenImporterImpl::new(conn, config);

            // Ctrl-C → 当前阶段结束后回滚
            let token = importer.cancel_handle().token();
            tokio::spawn(async move {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_ok() {
                            tracing::warn!("收到中断信号，导入将在当前阶段结束后回滚");
                            token.cancel();
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });

            let summary = importer
                .import_files(&container, mode.into(), &files)
                .await
                .with_context(|| format!("容器 {} 导入失败", container))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
