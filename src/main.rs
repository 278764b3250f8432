use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use digit_recognition::config::{Config, DatabaseTarget};
use digit_recognition::inference::InferenceAdapter;
use digit_recognition::normalize::{InversionPolicy, StandardNormalizer};
use digit_recognition::pipeline::PredictionPipeline;
use digit_recognition::server::{self, AppState, ServerOptions};
use digit_recognition::storage::DrawingStore;
use digit_recognition::{logging, metrics};

#[derive(Parser)]
#[command(name = "digit_recognition")]
#[command(about = "Handwritten digit recognition API")]
#[command(version)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to run the server on
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// ONNX model file (overrides MODEL_PATH)
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    dotenv::dotenv().ok();

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(path) = cli.model_path {
        config.model_path = path;
    }
    if let Some(url) = cli.database_url {
        let token = std::env::var("DATABASE_AUTH_TOKEN").ok();
        config.database = DatabaseTarget::parse(&url, token)?;
    }

    logging::init_logging(&config.log_dir);

    println!("🚀 Starting digit recognition API on port {}...", cli.port);

    // The service must not take traffic without a model.
    let adapter = Arc::new(InferenceAdapter::new());
    adapter
        .load_onnx(&config.model_path)
        .with_context(|| format!("failed to load model from {}", config.model_path.display()))?;

    let store = open_store(&config).await?;

    let inversion = if config.invert_strokes {
        InversionPolicy::default()
    } else {
        InversionPolicy::Disabled
    };
    let normalizer = StandardNormalizer::new(inversion);
    info!("Prediction pipeline ready (inversion: {:?})", normalizer.inversion());
    let pipeline = PredictionPipeline::new(adapter, Arc::new(normalizer), store);

    let metrics = if config.metrics_enabled {
        metrics::init_metrics()
    } else {
        None
    };

    let state = AppState {
        pipeline: Arc::new(pipeline),
        metrics,
    };
    let options = ServerOptions {
        api_prefix: config.api_prefix.clone(),
        cors_origins: config.cors_origins.clone(),
    };

    server::start_server(state, &options, &cli.host, cli.port).await
}

#[cfg(feature = "db")]
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DrawingStore>> {
    use digit_recognition::db::LibsqlDrawingStore;

    info!("Initializing database storage...");
    let store = LibsqlDrawingStore::connect(&config.database)
        .await
        .context("failed to initialize database")?;
    info!("Database storage initialized successfully");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "db"))]
async fn open_store(_config: &Config) -> anyhow::Result<Arc<dyn DrawingStore>> {
    use digit_recognition::storage::InMemoryStorage;

    tracing::warn!("Built without the `db` feature; drawings are kept in memory only");
    Ok(Arc::new(InMemoryStorage::new()))
}
