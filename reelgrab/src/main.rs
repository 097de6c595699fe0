use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use media_providers::adapter::Credentials;
use media_providers::{AdapterRegistry, LinkClassifier};
use reelgrab::bot::{Bot, BotDeps, RedditClient};
use reelgrab::config::AppConfig;
use reelgrab::delivery::{Delivery, LocalDirDelivery};
use reelgrab::logging::{init_logging, start_retention_cleanup};
use reelgrab::orchestrator::{ChatKind, DeliveryTarget, Orchestrator, PipelineDeps, Request};
use reelgrab::recorder::{JsonStatsRecorder, NoopRecorder, UsageRecorder};
use reelgrab::slideshow::FfmpegSynthesizer;
use reelgrab::telegram::{TelegramClient, TelegramDelivery};
use reelgrab::utils::http_client::install_rustls_provider;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Telegram bot
    Run,

    /// Download links once and save the media into a directory
    Fetch {
        /// Links or free text containing links
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,
    },

    /// Show which provider each link in the text belongs to
    Classify {
        text: Vec<String>,

        /// Link rules JSON file overriding the built-in table
        #[arg(long, env = "LINK_RULES_FILE")]
        rules: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    install_rustls_provider();

    match args.command {
        Commands::Run => run_bot().await,
        Commands::Fetch { urls, out } => fetch(urls, out).await,
        Commands::Classify { text, rules } => classify(&text.join(" "), rules),
    }
}

fn load_classifier(rules: Option<&PathBuf>) -> anyhow::Result<LinkClassifier> {
    match rules {
        Some(path) => LinkClassifier::from_json_file(path)
            .with_context(|| format!("Failed to load link rules from {}", path.display())),
        None => Ok(LinkClassifier::default()),
    }
}

fn build_orchestrator(
    config: &AppConfig,
    credentials: Arc<Credentials>,
    delivery: Arc<dyn Delivery>,
    recorder: Arc<dyn UsageRecorder>,
) -> Orchestrator {
    let registry = AdapterRegistry::with_extractors(&config.extractors, credentials);
    let synthesizer = FfmpegSynthesizer::new(
        &config.media.ffmpeg,
        &config.media.ffprobe,
        Duration::from_secs_f64(config.media.default_frame_secs),
        config.pipeline.synthesis_timeout(),
    )
    .with_video_optimization(config.media.optimize_videos);
    let deps = PipelineDeps {
        registry: Arc::new(registry),
        synthesizer: Arc::new(synthesizer),
        delivery,
        recorder,
    };
    Orchestrator::new(deps, config.pipeline.clone())
}

async fn run_bot() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;
    let token = config.require_bot_token()?.to_string();

    let cancel = CancellationToken::new();
    start_retention_cleanup(&config.logging, cancel.child_token());

    // Stopped last so records from draining jobs are still flushed.
    let stats_cancel = CancellationToken::new();
    let (stats, stats_task) = JsonStatsRecorder::start(
        config.stats.path.clone(),
        Duration::from_secs(config.stats.flush_interval_secs),
        stats_cancel.clone(),
    )
    .await;

    let client = Arc::new(TelegramClient::new(&config.bot.api_base, &token)?);
    let delivery = Arc::new(TelegramDelivery::new(client.clone(), config.max_upload_bytes()));
    let credentials = config.credentials.build().into_shared();
    let orchestrator = build_orchestrator(&config, credentials.clone(), delivery, Arc::new(stats.clone()));
    let classifier = load_classifier(config.link_rules_file.as_ref())?;

    let bot = Bot::new(
        config.bot.clone(),
        BotDeps {
            client,
            orchestrator: orchestrator.clone(),
            classifier: Arc::new(classifier),
            reddit: RedditClient::new()?,
            stats,
            credentials,
        },
    );

    let poll_cancel = cancel.clone();
    let mut poller = tokio::spawn(async move { bot.run(poll_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        joined = &mut poller => match joined {
            Ok(Err(e)) => error!(error = %e, "bot stopped with error"),
            Err(e) => error!(error = %e, "bot task panicked"),
            Ok(Ok(())) => {}
        },
    }

    cancel.cancel();
    orchestrator.shutdown().await;
    if !poller.is_finished() {
        let _ = poller.await;
    }
    stats_cancel.cancel();
    if let Err(e) = stats_task.await {
        error!(error = %e, "stats writer task failed");
    }
    info!("shutdown complete");
    Ok(())
}

async fn fetch(urls: Vec<String>, out: PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    let text = urls.join(" ");
    let classifier = load_classifier(config.link_rules_file.as_ref())?;
    let links = classifier.classify(&text);
    if links.is_empty() {
        anyhow::bail!("No supported links found in: {text}");
    }

    let delivery = Arc::new(LocalDirDelivery::new(&out));
    let orchestrator = build_orchestrator(
        &config,
        config.credentials.build().into_shared(),
        delivery,
        Arc::new(NoopRecorder),
    );
    let target = DeliveryTarget {
        chat_id: 0,
        message_id: 0,
        chat_kind: ChatKind::Private,
        sender_id: None,
        sender_name: None,
    };
    let request = Request::new(target, text, links);

    let mut failed = 0;
    for outcome in orchestrator.run_request(&request).await.into_iter().flatten() {
        match (&outcome.receipt, &outcome.failure) {
            (_, Some(failure)) => {
                failed += 1;
                println!("✗ {} [{}] {}", outcome.url, failure.kind, failure.message);
            }
            (Some(receipt), None) => {
                for item in &receipt.items {
                    println!("✓ {} -> {}", outcome.url, item.file_ref);
                }
            }
            (None, None) => println!("- {} (nothing delivered)", outcome.url),
        }
    }
    orchestrator.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} link(s) failed");
    }
    Ok(())
}

fn classify(text: &str, rules: Option<PathBuf>) -> anyhow::Result<()> {
    let classifier = load_classifier(rules.as_ref())?;
    let links = classifier.classify(text);
    if links.is_empty() {
        println!("No supported links found.");
    }
    for link in links {
        let alias = if link.alias { " (alias)" } else { "" };
        println!("{:<10} {}{alias}", link.provider.as_str(), link.url);
    }
    Ok(())
}
