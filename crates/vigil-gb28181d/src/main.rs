use anyhow::{anyhow, Context};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_config::ConfigLoader;
use vigil_gb28181::sip::{DeviceRegistry, PortRangeAllocator, SipServer, SipServerConfig};

mod api;
mod observer;
mod ports;
mod signal;

use api::AppState;
use observer::DiscoveryObserver;
use ports::PortLeases;
use signal::SignalHandler;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置目录（global.toml 与 protocols/gb28181.toml）
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// 覆盖 [http].bind
    #[arg(long)]
    http_bind: Option<String>,

    /// 覆盖 SIP 监听地址（ip:port）
    #[arg(long)]
    sip_bind: Option<String>,

    /// 覆盖 [logging].level
    #[arg(long)]
    log_level: Option<String>,

    /// 打印生效的 SIP 配置后退出
    #[arg(long)]
    print_config: bool,
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;

    let (plain, json) = if json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()?;
    Ok(())
}

/// 合并配置文件与命令行参数
fn sip_config(loader: &ConfigLoader, args: &Args) -> anyhow::Result<SipServerConfig> {
    let mut config = loader
        .load_protocol_or_default::<SipServerConfig>("gb28181")?
        .server;

    if let Some(bind) = &args.sip_bind {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow!("invalid sip_bind {}: {}", bind, e))?;
        config.sip_ip = addr.ip().to_string();
        config.sip_port = addr.port();
    }

    config.validate().map_err(|e| anyhow!("invalid gb28181 config: {}", e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new(&args.config_dir);
    let mut global = loader.load_global()?;
    if let Some(level) = &args.log_level {
        global.logging.level = level.clone();
    }
    init_logging(&global.logging.level, global.logging.json)?;
    loader.validate()?;

    let sip_cfg = sip_config(&loader, &args)?;
    if args.print_config {
        println!("{}", ConfigLoader::render(&sip_cfg)?);
        return Ok(());
    }

    tracing::info!(
        target: "gb28181d",
        name = %global.system.name,
        version = %global.system.version,
        config_dir = %loader.config_dir().display(),
        "Starting",
    );

    let (observer, mut removed_rx) = DiscoveryObserver::new();
    let observer = Arc::new(observer);
    let registry = Arc::new(DeviceRegistry::with_observer(observer.clone()));

    let range = sip_cfg.rtp_port_range;
    let sip = Arc::new(SipServer::bind_with_registry(sip_cfg, registry).await?);
    let leases = Arc::new(PortLeases::new(Arc::new(PortRangeAllocator::new(
        range.start,
        range.end,
    ))));

    // 设备被移除（过期、注销、删除）后回收其 RTP 端口
    let reaper_leases = leases.clone();
    tokio::spawn(async move {
        while let Some(device_id) = removed_rx.recv().await {
            let released = reaper_leases.release_device(&device_id).await;
            if released > 0 {
                tracing::info!(target: "gb28181d", %device_id, released, "Released RTP ports");
            }
        }
    });

    let (signals, mut shutdown_rx) = SignalHandler::new();
    let signals = Arc::new(signals);

    let sip_task = {
        let sip = sip.clone();
        let signals = signals.clone();
        tokio::spawn(async move {
            sip.clone().run().await;
            if !sip.is_shutdown() {
                tracing::error!(target: "gb28181d", "SIP server stopped unexpectedly");
                signals.trigger_shutdown();
            }
        })
    };

    let signal_task = {
        let signals = signals.clone();
        tokio::spawn(async move {
            if let Err(e) = signals.wait_for_system_signal().await {
                tracing::error!(target: "gb28181d", error = %e, "Failed to install signal handlers");
            }
        })
    };

    let state = AppState {
        sip: sip.clone(),
        leases,
        observer,
    };
    let app = api::router(state);

    let addr = args.http_bind.unwrap_or(global.http.bind);
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid http_bind {}: {}", addr, e))?;
    tracing::info!(target: "gb28181d", %addr, sip = %sip.local_addr(), "HTTP listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    sip.shutdown();
    let _ = sip_task.await;
    signal_task.abort();

    tracing::info!(target: "gb28181d", "Stopped");
    Ok(())
}
