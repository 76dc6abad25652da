//! lector CLI — narration server and its control client.
//!
//! ```text
//! lector serve [--port 2004] [--host 127.0.0.1] [--voice af_heart] [--backend network]
//! lector download [--models-dir DIR]
//! lector load book.md [--markdown]
//! lector play 3 / jump 5 / toggle / stop / seek 1.5 / rate 1.25 [--server ...]
//! lector status / events / toc "Chapter 2" / backend [on-device|network] / sidecar
//! lector background / foreground / memory-warning
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lector_core::types::BackendKind;
use lector_lib::backend::network::NetworkBackend;
use lector_lib::backend::on_device::OnDeviceBackend;
use lector_lib::backend::sidecar::SidecarRuntime;
use lector_lib::download::{self, ModelFiles};
use lector_lib::engine::ReaderEngine;
use lector_lib::manager::SidecarManager;
use lector_lib::output::RodioOutput;
use lector_lib::selector::BackendSelector;
use lector_lib::{config, server};

const DEFAULT_SERVER: &str = "http://localhost:2004";

/// lector — streaming narration server
#[derive(Parser)]
#[command(name = "lector", version, about)]
struct Cli {
    /// Server URL for client commands
    #[arg(long, global = true, default_value = DEFAULT_SERVER)]
    server: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    OnDevice,
    Network,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::OnDevice => BackendKind::OnDevice,
            BackendArg::Network => BackendKind::Network,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start the narration server
    Serve {
        /// Listen port
        #[arg(long, default_value = "2004")]
        port: u16,
        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Config file (defaults to the user config dir)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Voice id
        #[arg(long)]
        voice: Option<String>,
        /// Speech speed passed to the backends
        #[arg(long)]
        speed: Option<f32>,
        /// Preferred backend
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Kokoro-FastAPI server URL for the network backend
        #[arg(long)]
        network_url: Option<String>,
        /// Directory holding the on-device model files
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
    /// Download the on-device model files
    Download {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
    /// Load a text or markdown document into the server
    Load {
        file: PathBuf,
        /// Strip markdown (implied for .md files)
        #[arg(long)]
        markdown: bool,
    },
    /// Play a paragraph from the start
    Play { index: usize },
    /// Move to a paragraph, keeping play/pause state
    Jump { index: usize },
    /// Jump to a table-of-contents entry
    Toc {
        label: String,
        #[arg(long)]
        anchor: Option<String>,
    },
    /// Toggle play/pause
    Toggle,
    /// Stop playback and generation
    Stop,
    /// Seek within the current segment (seconds)
    Seek { position: f64 },
    /// Set the playback rate
    Rate { rate: f32 },
    /// Set the voice for paragraphs generated from now on
    Voice {
        voice: String,
        #[arg(long, default_value = "1.0")]
        speed: f32,
    },
    /// Show reader status
    Status,
    /// Follow the event stream
    Events,
    /// Show or set the preferred backend
    Backend {
        #[arg(value_enum)]
        preference: Option<BackendArg>,
    },
    /// Show local sidecar status
    Sidecar,
    /// Tell the server the host went to the background
    Background,
    /// Tell the server the host came back to the foreground
    Foreground,
    /// Tell the server the host is low on memory
    MemoryWarning,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lector_lib=debug,lector_cli=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("lector: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let server = cli.server;
    match cli.command {
        Command::Serve {
            port,
            host,
            config,
            voice,
            speed,
            backend,
            network_url,
            models_dir,
        } => {
            let config_path = config.unwrap_or_else(config::default_path);
            let mut cfg = config::load(&config_path)?;
            if let Some(voice) = voice {
                cfg.voice = voice;
            }
            if let Some(speed) = speed {
                cfg.speed = speed;
            }
            if let Some(backend) = backend {
                cfg.backend = backend.into();
            }
            if let Some(url) = network_url {
                cfg.network_url = url;
            }
            if models_dir.is_some() {
                cfg.models_dir = models_dir;
            }
            serve(&host, port, cfg, config_path).await
        }

        Command::Download { config, models_dir } => {
            let config_path = config.unwrap_or_else(config::default_path);
            let mut cfg = config::load(&config_path)?;
            if models_dir.is_some() {
                cfg.models_dir = models_dir;
            }
            let dir = cfg
                .models_dir
                .clone()
                .unwrap_or_else(download::default_models_dir);

            let files = download::ensure_models(&dir, |p| {
                eprint!("\r{:<14} {:>5.1}%", p.model, p.percent);
                if p.status == "complete" {
                    eprintln!();
                }
            })
            .await?;

            cfg.on_device_ready = true;
            config::save(&config_path, &cfg)?;
            println!("model:  {}", files.model.display());
            println!("voices: {}", files.voices.display());
            Ok(())
        }

        Command::Load { file, markdown } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
            let markdown = markdown || file.extension().is_some_and(|ext| ext == "md");
            post_json(
                &server,
                "paragraphs",
                json!({ "text": text, "markdown": markdown }),
            )
            .await
        }

        Command::Play { index } => post_json(&server, "play", json!({ "index": index })).await,
        Command::Jump { index } => post_json(&server, "jump", json!({ "index": index })).await,
        Command::Toc { label, anchor } => {
            post_json(
                &server,
                "toc/jump",
                json!({ "label": label, "anchor": anchor }),
            )
            .await
        }
        Command::Toggle => post_simple(&server, "toggle").await,
        Command::Stop => post_simple(&server, "stop").await,
        Command::Seek { position } => {
            post_json(&server, "seek", json!({ "position": position })).await
        }
        Command::Rate { rate } => post_json(&server, "rate", json!({ "rate": rate })).await,
        Command::Voice { voice, speed } => {
            post_json(&server, "voice", json!({ "voice": voice, "speed": speed })).await
        }
        Command::Status => get_simple(&server, "status").await,
        Command::Events => follow_events(&server).await,
        Command::Backend { preference } => match preference {
            Some(pref) => {
                let kind = BackendKind::from(pref);
                post_json(&server, "backend", json!({ "preference": kind })).await
            }
            None => get_simple(&server, "backend").await,
        },
        Command::Sidecar => get_simple(&server, "sidecar").await,
        Command::Background => post_simple(&server, "lifecycle/background").await,
        Command::Foreground => post_simple(&server, "lifecycle/foreground").await,
        Command::MemoryWarning => post_simple(&server, "lifecycle/memory-warning").await,
    }
}

async fn serve(
    host: &str,
    port: u16,
    cfg: lector_core::types::ReaderConfig,
    config_path: PathBuf,
) -> Result<(), String> {
    let models_dir = cfg
        .models_dir
        .clone()
        .unwrap_or_else(download::default_models_dir);
    let ready = cfg.on_device_ready || ModelFiles::in_dir(&models_dir).installed();
    info!(
        "lector: on-device {} (models in {})",
        if ready { "ready" } else { "not installed" },
        models_dir.display()
    );

    let manager = Arc::new(SidecarManager::new(cfg.local_port));
    let runtime = SidecarRuntime::new(manager.clone(), models_dir.clone());
    let on_device = Arc::new(OnDeviceBackend::new(Box::new(runtime), ready));
    let network = Arc::new(NetworkBackend::new(
        cfg.network_url.clone(),
        cfg.network_max_chars,
    ));
    let selector = Arc::new(BackendSelector::new(on_device, network, cfg.backend));

    let output = RodioOutput::spawn()?;
    let engine = ReaderEngine::new(selector, output, cfg.voice_params());
    let app = server::router(engine, config_path)
        .merge(server::sidecar_router(manager.clone(), models_dir));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!("lector listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))?;

    manager.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("lector: shutting down");
}

async fn post_simple(server: &str, endpoint: &str) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}

async fn post_json(server: &str, endpoint: &str, body: serde_json::Value) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .post(format!("{server}/{endpoint}"))
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}

async fn get_simple(server: &str, endpoint: &str) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .get(format!("{server}/{endpoint}"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    println!("{}", resp.text().await.unwrap_or_default());
    Ok(())
}

/// Print SSE `data:` lines as they arrive.
async fn follow_events(server: &str) -> Result<(), String> {
    let resp = reqwest::Client::new()
        .get(format!("{server}/events"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("event stream error: {e}"))?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buf.find('\n') {
            let line: String = buf.drain(..=end).collect();
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                println!("{}", data.trim_start());
            }
        }
    }
    Ok(())
}
