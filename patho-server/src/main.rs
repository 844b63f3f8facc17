//! 病理阅片服务器主程序

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use patho_admin::{init_logging, ConfigManager, ConfigValidator, DatabaseBackend, PathoConfig};
use patho_core::{Clinician, Clock, SystemClock};
use patho_database::{DatabasePool, MemoryStore, PathologyStore, PgStore, PoolOptions};
use patho_integration::{CommandTileGenerator, ImageRegionCropper, TilingQueue, TilingWorker};
use patho_report::{DocxTemplate, ImageSizing, ReportGenerator, ReportSettings};
use patho_storage::StorageManager;
use patho_web::{AppState, AuthService, UploadSettings, WebServer};
use patho_workflow::{DiagnosisListing, ListingPolicy, PathologyService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 服务器命令行参数，优先于配置文件
#[derive(Parser, Debug)]
#[command(name = "patho-server")]
#[command(about = "病理切片阅片与诊断报告服务")]
struct Args {
    /// 配置文件路径 (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 监听地址
    #[arg(long)]
    host: Option<String>,

    /// 日志级别，EnvFilter 语法
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager =
        ConfigManager::load(args.config.as_deref()).context("failed to load configuration")?;
    let mut config = manager.get_config().await;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    ConfigValidator::new()
        .validate(&config)
        .context("invalid command line override")?;

    init_logging(&config.logging)?;
    info!("启动病理阅片服务器...");

    let state = build_state(&config).await?;

    let addr = tokio::net::lookup_host((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("failed to resolve {}", config.server.host))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", config.server.host))?;

    WebServer::new(addr, state)
        .run_until(shutdown_signal())
        .await?;
    Ok(())
}

async fn build_state(config: &PathoConfig) -> Result<AppState> {
    let store: Arc<dyn PathologyStore> = match config.database.backend {
        DatabaseBackend::Memory => {
            warn!("Using the in-memory store, records are lost on restart");
            Arc::new(MemoryStore::new())
        }
        DatabaseBackend::Postgres => {
            let pool = DatabasePool::connect(&PoolOptions {
                url: config.database.url.clone(),
                max_connections: config.database.max_connections,
                min_connections: config.database.min_connections,
                connect_timeout: Duration::from_secs(config.database.connect_timeout_secs),
            })
            .await?;
            let store = PgStore::new(pool);
            store.create_tables().await?;
            Arc::new(store)
        }
    };

    tokio::fs::create_dir_all(&config.storage.media_root)
        .await
        .with_context(|| {
            format!(
                "failed to create media root {}",
                config.storage.media_root.display()
            )
        })?;
    let storage = StorageManager::new(&config.storage.media_root);
    info!("Media root: {}", config.storage.media_root.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = PathologyService::new(store.clone(), clock.clone());
    let listing = DiagnosisListing::new(
        store,
        ListingPolicy {
            default_limit: config.listing.default_limit,
            max_limit: config.listing.max_limit,
        },
    );

    let (tiling, receiver) =
        TilingQueue::channel(config.tiling.queue_capacity, config.tiling.max_attempts);
    if config.tiling.enabled {
        let generator =
            CommandTileGenerator::new(config.tiling.command.clone(), config.tiling.args.clone());
        let worker = TilingWorker::new(
            service.clone(),
            storage.clone(),
            Arc::new(generator),
            Duration::from_millis(config.tiling.retry_delay_ms),
            &tiling,
        );
        tokio::spawn(worker.run(receiver));
    } else {
        warn!("Tiling is disabled, uploaded pictures will not be tiled");
        tokio::spawn(async move {
            let mut receiver = receiver;
            while let Some(task) = receiver.recv().await {
                warn!("Skipping tiling of picture {}", task.picture_id);
            }
        });
    }

    let settings = ReportSettings {
        template_path: config.report.template_path.clone(),
        sizing: ImageSizing {
            width_mm: config.report.image_width_mm,
            max_height_mm: config.report.image_max_height_mm,
        },
        filename_suffix: config.report.filename_suffix.clone(),
        utc_offset_minutes: config.report.utc_offset_minutes,
    };
    check_template(&settings).await;
    let reports = ReportGenerator::new(service.clone(), storage.clone(), clock, settings);

    let auth = config
        .auth
        .clinicians
        .iter()
        .fold(AuthService::new(), |auth, entry| {
            auth.with_clinician(
                &entry.token_sha256,
                Clinician {
                    id: entry.id,
                    username: entry.username.clone(),
                    name: entry.name.clone(),
                },
            )
        });
    if auth.clinician_count() == 0 {
        warn!("No clinicians configured, every request is anonymous");
    } else {
        info!("Loaded {} clinician credentials", auth.clinician_count());
    }

    Ok(AppState {
        service,
        listing,
        storage: storage.clone(),
        tiling,
        cropper: Arc::new(
            ImageRegionCropper::new(storage)
                .with_max_decode_bytes(config.storage.crop_max_decode_bytes()),
        ),
        reports,
        auth: Arc::new(auth),
        uploads: UploadSettings {
            max_upload_bytes: config.server.max_upload_bytes(),
            media_url: config.server.media_url.clone(),
        },
    })
}

/// 模板在每次请求时重新加载，这里只提前报告问题
async fn check_template(settings: &ReportSettings) {
    match DocxTemplate::open(&settings.template_path).await {
        Ok(template) => match template.placeholders() {
            Ok(keys) => info!(
                "Report template {} has {} placeholders",
                settings.template_path.display(),
                keys.len()
            ),
            Err(e) => warn!("Report template has malformed placeholders: {}", e),
        },
        Err(e) => warn!(
            "Report template {} is not usable yet: {}",
            settings.template_path.display(),
            e
        ),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
