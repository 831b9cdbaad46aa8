use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scene_sampler::handler::{self, AppState};
use scene_sampler::{AnalyzeResponse, ConfigLoader, ExtendedConfig, ScenePipeline, StorageLifecycle};

/// 场景拆解工具 - 检测视频镜头切换，并为每个场景抽取代表帧
#[derive(Parser, Debug)]
#[command(name = "scene-sampler")]
#[command(about = "场景拆解工具：检测镜头切换、按场景时长采样代表帧", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CLI 模式：处理本地视频文件，结果以 JSON 输出到标准输出
    Process {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 帧输出的基础目录（覆盖配置中的 base_dir）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 配置文件路径
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 场景检测阈值，值越大场景越少
        #[arg(long)]
        threshold: Option<f64>,

        /// 每个场景采样的帧数
        #[arg(long)]
        frames_per_scene: Option<usize>,
    },
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（默认从环境变量 FC_SERVER_PORT 读取，如果不存在则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// 执行一次过期工作目录清理
    Sweep {
        /// 配置文件路径
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 覆盖配置中的 TTL（秒）
        #[arg(long)]
        max_age_secs: Option<u64>,

        /// 删除全部工作目录
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(default_value = "scene-sampler.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Process {
            input,
            output,
            config,
            threshold,
            frames_per_scene,
        } => {
            let mut config = ConfigLoader::new(config.as_deref())?.resolve(threshold, frames_per_scene)?;
            if let Some(output) = output {
                config.base_dir = output;
            }
            init_tracing(&config.log_level);

            let response = process_local(&input, &config).await.context("处理视频失败")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Serve { bind, config } => {
            let config = ConfigLoader::load_extended_config(config.as_deref())?;
            init_tracing(&config.log_level);

            // 优先使用命令行参数，其次使用环境变量 FC_SERVER_PORT，最后使用默认值 9000
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("FC_SERVER_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            });
            start_web_server(&bind_addr, config).await?;
        }
        Commands::Sweep {
            config,
            max_age_secs,
            all,
        } => {
            let config = ConfigLoader::load_extended_config(config.as_deref())?;
            init_tracing(&config.log_level);

            let storage = StorageLifecycle::new(&config.base_dir, config.ttl())?;
            let report = if all {
                storage.purge_all()
            } else {
                storage.evict_older_than(max_age_secs.map(Duration::from_secs).unwrap_or(config.ttl()))
            };
            info!(
                "清理完成: 删除 {}，失败 {}，跳过 {}",
                report.removed, report.failed, report.skipped
            );
        }
        Commands::InitConfig { path } => {
            init_tracing("info");
            ConfigLoader::create_default_config(&path)?;
            info!("✅ 已生成默认配置文件: {}", path.display());
        }
    }

    Ok(())
}

/// RUST_LOG 优先，否则使用配置中的日志级别
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn process_local(input: &std::path::Path, config: &ExtendedConfig) -> Result<AnalyzeResponse> {
    if !input.is_file() {
        anyhow::bail!("输入文件不存在: {}", input.display());
    }

    let storage = StorageLifecycle::new(&config.base_dir, config.ttl())?;
    let pipeline = ScenePipeline::new(config.build_detector()?, config.build_rasterizer());
    let workspace = storage.allocate()?;

    match pipeline.process(input, &workspace, config.process).await {
        Ok(scenes) => {
            info!("帧输出目录: {}", workspace.directory.display());
            Ok(AnalyzeResponse {
                request_id: workspace.request_id.to_string(),
                frames_base_url: format!("{}/", workspace.directory.display()),
                created_at: workspace.created_at,
                scene_count: scenes.len(),
                scenes,
            })
        }
        Err(e) => {
            if let Err(cleanup) = storage.delete_now(workspace.request_id) {
                warn!("⚠️  清理工作目录失败: {}", cleanup);
            }
            Err(e.into())
        }
    }
}

async fn start_web_server(bind: &str, config: ExtendedConfig) -> Result<()> {
    let storage = StorageLifecycle::new(&config.base_dir, config.ttl())
        .context(format!("初始化存储目录失败: {}", config.base_dir.display()))?;
    storage.evict_expired();

    let state = Arc::new(AppState {
        pipeline: ScenePipeline::new(config.build_detector()?, config.build_rasterizer()),
        storage: storage.clone(),
        defaults: config.process,
    });
    let app = handler::router(state, config.max_upload_bytes());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    info!("Web 服务器启动在: http://{}", bind);
    info!("健康检查: http://{}/health", bind);
    info!("场景分析: POST http://{}/analyze", bind);
    info!(
        "工作目录: {} (保留 {}s)",
        storage.base_dir().display(),
        storage.ttl().as_secs()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("启动服务器失败")?;

    let report = storage.purge_all();
    info!("服务已停止，清理 {} 个工作目录", report.removed);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️  无法监听 Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("⚠️  无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("收到退出信号，正在关闭服务...");
}
