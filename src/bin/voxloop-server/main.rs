use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::middleware::from_fn;
use axum::routing::get;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::level_filters::LevelFilter;
use tracing::{Level, error, info};

mod metrics;
mod remote;
mod ws;

use voxloop::collaborators::TurnStore;
use voxloop::intent::ExitKeywordDetector;
use voxloop::store::WavTurnStore;
use voxloop::{ClassifierFactory, DialogueOrchestrator, EngineConfig, Services};

#[derive(Parser, Debug)]
#[command(name = "voxloop-server")]
#[command(about = "WebSocket voice dialogue server for always-connected devices")]
struct Params {
    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8091)]
    port: u16,

    /// JSON engine config; defaults apply to anything it leaves out.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Speech recognition endpoint (WAV in, `{"text"}` out).
    #[arg(long = "stt-url", required = true)]
    stt_url: String,

    /// Speech synthesis endpoint (`{"text","voice"}` in, WAV out).
    #[arg(long = "tts-url", required = true)]
    tts_url: String,

    /// Streaming chat endpoint (JSON in, newline-delimited JSON out).
    #[arg(long = "llm-url", required = true)]
    llm_url: String,

    /// Role bound to devices that connect without `role_id`.
    #[arg(long = "default-role")]
    default_role: Option<String>,

    /// Directory for recorded turns (WAV + JSON-lines index). Recording is off when unset.
    #[arg(long = "store-dir")]
    store_dir: Option<PathBuf>,

    /// How often idle sessions are checked, in seconds.
    #[arg(long = "sweep-interval", default_value_t = 10)]
    sweep_interval_secs: u64,

    /// Silero VAD model (ONNX). The energy classifier is used when unset.
    #[cfg(feature = "silero-onnx")]
    #[arg(long = "vad-model")]
    vad_model: Option<PathBuf>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) orchestrator: Arc<DialogueOrchestrator>,
    pub(crate) default_role: Option<String>,
}

#[tokio::main]
async fn main() {
    voxloop::logging::init_with_default(LevelFilter::INFO);

    if let Err(err) = run().await {
        error!(error = ?err, "voxloop-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();
    metrics::init();

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let config = match &params.config {
        Some(path) => EngineConfig::from_json_file(path).context("failed to load engine config")?,
        None => EngineConfig::default(),
    };

    let orchestrator = build_orchestrator(&params, config)?;
    let shutdown = CancellationToken::new();
    let sweep = orchestrator.spawn_inactivity_sweep(
        Duration::from_secs(params.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let state = AppState {
        orchestrator,
        default_role: params.default_role.clone(),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/ws", get(ws::ws_upgrade))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = sweep.await;
    Ok(())
}

fn build_orchestrator(params: &Params, config: EngineConfig) -> Result<Arc<DialogueOrchestrator>> {
    let client = remote::http_client()?;
    let store = match &params.store_dir {
        Some(dir) => Some(Arc::new(
            WavTurnStore::new(dir).context("failed to open turn store")?,
        ) as Arc<dyn TurnStore>),
        None => None,
    };

    let services = Services {
        stt: Arc::new(remote::HttpStt::new(client.clone(), &params.stt_url)),
        tts: Arc::new(remote::HttpTts::new(client.clone(), &params.tts_url)),
        llm: Arc::new(remote::HttpLlm::new(client, &params.llm_url)),
        intent: Arc::new(ExitKeywordDetector::new().context("failed to build intent detector")?),
        store,
    };

    Ok(match classifier_factory(params)? {
        Some(factory) => DialogueOrchestrator::with_classifier_factory(config, services, factory),
        None => DialogueOrchestrator::new(config, services),
    })
}

#[cfg(feature = "silero-onnx")]
fn classifier_factory(params: &Params) -> Result<Option<ClassifierFactory>> {
    use voxloop::vad::{SileroClassifier, SpeechClassifier};

    let Some(model) = params.vad_model.clone() else {
        return Ok(None);
    };
    // Load once here so a bad path fails at startup, not on the first connect.
    SileroClassifier::new(&model).context("failed to load Silero VAD model")?;
    Ok(Some(Arc::new(move || {
        Ok(Box::new(SileroClassifier::new(&model)?) as Box<dyn SpeechClassifier>)
    })))
}

#[cfg(not(feature = "silero-onnx"))]
fn classifier_factory(_params: &Params) -> Result<Option<ClassifierFactory>> {
    Ok(None)
}

async fn root() -> &'static str {
    "voxloop-server: GET /ws (binary: opus frames, text: json control)"
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_required() {
        let res = Params::try_parse_from(["voxloop-server", "--stt-url", "http://stt"]);
        assert!(res.is_err());
    }

    #[test]
    fn defaults_fill_optional_flags() -> anyhow::Result<()> {
        let params = Params::try_parse_from([
            "voxloop-server",
            "--stt-url",
            "http://stt",
            "--tts-url",
            "http://tts",
            "--llm-url",
            "http://llm",
        ])?;
        assert_eq!(params.port, 8091);
        assert_eq!(params.sweep_interval_secs, 10);
        assert!(params.store_dir.is_none());
        assert!(params.default_role.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn builds_without_a_store() -> anyhow::Result<()> {
        let params = Params::try_parse_from([
            "voxloop-server",
            "--stt-url",
            "http://stt",
            "--tts-url",
            "http://tts",
            "--llm-url",
            "http://llm",
        ])?;
        let orchestrator = build_orchestrator(&params, EngineConfig::default())?;
        assert!(orchestrator.registry().is_empty());
        Ok(())
    }
}
