use anyhow::{bail, Context, Result};
use futures::StreamExt;
use moo_backend::{
    download::HttpByteSource, sources::YtDlpResolver, Config, MediaService, ResolveError,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

const USAGE: &str = "usage: moo-backend <search|video|playlist|audio|artist|download> <arg>\n       moo-backend --health-check";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs a stderr; stdout queda para los payloads
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("moo_backend=info".parse()?),
        )
        .init();

    info!("🐄 Iniciando Moo Backend v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("⚙️ {}", config.summary());

    let resolver = Arc::new(YtDlpResolver::new(
        config.ytdlp_path.clone(),
        config.max_playlist_size,
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&resolver).await;
    }

    let (command, arg) = match args.as_slice() {
        [command, arg] => (command.as_str(), arg.as_str()),
        _ => bail!(USAGE),
    };

    let service = MediaService::from_config(&config, resolver)?;
    let maintenance = service.start(config.cleanup_interval);

    let outcome = run(&service, command, arg).await;

    service.shutdown();
    maintenance.await.ok();

    match outcome {
        Ok(()) => Ok(()),
        Err(Failure::Resolve(e)) => {
            error!("❌ {} {} falló: {}", command, arg, e);
            eprintln!("{}", serde_json::to_string(&e.body())?);
            std::process::exit(exit_code(&e));
        }
        Err(Failure::Other(e)) => Err(e),
    }
}

enum Failure {
    Resolve(ResolveError),
    Other(anyhow::Error),
}

impl From<ResolveError> for Failure {
    fn from(e: ResolveError) -> Self {
        Failure::Resolve(e)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        Failure::Other(e)
    }
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Failure::Other(e.into())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Other(e.into())
    }
}

async fn run(
    service: &MediaService<YtDlpResolver, HttpByteSource<YtDlpResolver>>,
    command: &str,
    arg: &str,
) -> std::result::Result<(), Failure> {
    let mut stdout = tokio::io::stdout();

    let body = match command {
        "search" => serde_json::to_vec(&service.search(arg).await?)?,
        "video" => serde_json::to_vec(&service.video(arg).await?)?,
        "playlist" => service.playlist(arg).await?.to_vec(),
        "audio" => service.audio(arg).await?.to_vec(),
        "artist" => service.artist(arg).await?.to_vec(),
        "download" => {
            let mut download = service.download(arg).await?;
            while let Some(chunk) = download.next().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
            return Ok(());
        }
        other => return Err(anyhow::anyhow!("unknown command {}\n{}", other, USAGE).into()),
    };

    stdout.write_all(&body).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn exit_code(e: &ResolveError) -> i32 {
    match e.status_code() {
        400 => 2,
        404 => 3,
        _ => 1,
    }
}

async fn health_check(resolver: &YtDlpResolver) -> Result<()> {
    let version = resolver
        .version()
        .await
        .context("yt-dlp no está disponible")?;
    info!("✅ yt-dlp {}", version);
    println!("OK");
    Ok(())
}
