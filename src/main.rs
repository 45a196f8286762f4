use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use corewarden::app::probe::ProbeMode;
use corewarden::app::supervisor::CoreEvent;
use corewarden::app::App;
use corewarden::model::{GroupId, ProfileId, RouteId, TestOutcome};

#[derive(Parser)]
#[command(name = "corewarden", version, about = "Proxy client control plane")]
struct Cli {
    /// 设置文件
    #[arg(long, default_value = "corewarden.yaml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 在监控下运行 profile，Ctrl-C 停止
    Run { profile: ProfileId },
    /// 打印生成的配置
    Generate {
        profile: ProfileId,
        #[arg(long)]
        route: Option<RouteId>,
    },
    /// 同步订阅组，不指定时同步全部
    Sync { groups: Vec<GroupId> },
    /// 延迟测试，不指定时测试全部
    Test {
        profiles: Vec<ProfileId>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// 只测 TCP 握手
        #[arg(long, conflicts_with = "batch")]
        tcp: bool,
        /// 整批共用一个 core
        #[arg(long)]
        batch: bool,
    },
    /// 打印组成员的分享链接
    Links { group: GroupId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = if cli.settings.exists() {
        corewarden::config::load_settings(&cli.settings)?
    } else {
        corewarden::config::Settings::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log.level)),
        )
        .init();

    let app = App::open(settings).context("failed to open data directory")?;
    match cli.command {
        Command::Run { profile } => run(&app, profile).await,
        Command::Generate { profile, route } => {
            let doc = app.generate(profile, route)?;
            println!("{}", doc.text());
            Ok(())
        }
        Command::Sync { groups } => sync(&app, groups).await,
        Command::Test {
            profiles,
            concurrency,
            tcp,
            batch,
        } => test(&app, &profiles, concurrency, tcp, batch).await,
        Command::Links { group } => {
            for link in app.share_links(group)? {
                println!("{link}");
            }
            Ok(())
        }
    }
}

async fn run(app: &App, profile: ProfileId) -> Result<()> {
    let mut events = app.supervisor().subscribe();
    let instance = app.start_profile(profile).await?;
    info!(pid = ?instance.pid, generation = instance.generation, "core running");

    let cancel = CancellationToken::new();
    let updater = app.spawn_auto_update(cancel.clone());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Ok(CoreEvent::Log(line)) => println!("{}", line.text),
                Ok(CoreEvent::CrashLoop { crashes }) => {
                    anyhow::bail!("core crashed {crashes} times in a row, giving up");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "log output lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    cancel.cancel();
    let _ = updater.await;
    if app.supervisor().state().is_active() {
        app.stop().await?;
    }
    Ok(())
}

async fn sync(app: &App, groups: Vec<GroupId>) -> Result<()> {
    let cancel = CancellationToken::new();
    let results = if groups.is_empty() {
        app.update_all(&cancel).await
    } else {
        app.syncer().sync_all(&groups, &cancel).await
    };
    for (group, result) in results {
        match result {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => eprintln!("group #{group}: {e}"),
        }
    }
    Ok(())
}

async fn test(
    app: &App,
    profiles: &[ProfileId],
    concurrency: Option<usize>,
    tcp: bool,
    batch: bool,
) -> Result<()> {
    let mut options = app.test_options();
    if let Some(n) = concurrency {
        options.concurrency = n.max(1);
    }
    let mode = match (tcp, batch) {
        (true, _) => ProbeMode::TcpPing,
        (false, true) => ProbeMode::BatchUrlTest,
        (false, false) => ProbeMode::UrlTest,
    };
    let mut session = app.test(profiles, options, mode)?;
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    while let Some(result) = session.next().await {
        match result.outcome {
            TestOutcome::Latency { latency } => {
                println!("#{}\t{}ms", result.profile_id, latency.as_millis())
            }
            TestOutcome::Failed { kind, message } => {
                println!("#{}\t{}\t{message}", result.profile_id, kind.as_str())
            }
        }
    }
    let summary = session.finish().await;
    println!(
        "completed={} failed={} cancelled={}",
        summary.completed, summary.failed, summary.cancelled
    );
    Ok(())
}
