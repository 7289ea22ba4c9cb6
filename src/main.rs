use std::{net::SocketAddr, sync::Arc};

use tracing::{error, info, warn};

mod assistant;
mod config;
mod error;
mod labels;
mod model;
mod prediction;
mod preprocess;
mod routes;
mod utils;

use assistant::{Assistant, GeminiClient, TextGenerator};
use config::Config;
use labels::ClassLabels;
use model::{InferenceBackend, InferenceEngine, ModelLoadError, TensorflowModel};
use preprocess::Preprocessor;
use routes::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    utils::init_tracing();

    let config = Config::from_env()?;
    let files = utils::prepare_model_files(&config).await;

    let labels = Arc::new(ClassLabels::load(&config.class_list_path)?);
    info!(count = labels.len(), path = %config.class_list_path.display(), "class labels loaded");

    let engine = if files.model {
        load_engine(&config, &labels)?
    } else {
        InferenceEngine::unavailable()
    };
    let assistant = Assistant::new(
        load_generator(&config),
        labels.clone(),
        config.diagnosis_domain.clone(),
    );

    let state = Arc::new(AppState {
        service_name: config.service_name.clone(),
        engine,
        preprocessor: Preprocessor::new(config.input_size, config.normalization.clone()),
        labels,
        activation: config.activation,
        assistant,
    });
    let app = routes::router(state, config.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// A model that fails to load leaves the service running without it; a model
/// whose output disagrees with the class list is a fatal configuration error.
fn load_engine(config: &Config, labels: &ClassLabels) -> Result<InferenceEngine, ModelLoadError> {
    let model = match TensorflowModel::load(&config.model_path, &config.input_op, &config.output_op) {
        Ok(model) => model,
        Err(err) => {
            error!(
                error = %err,
                path = %config.model_path.display(),
                "model not loaded, serving without predictions"
            );
            return Ok(InferenceEngine::unavailable());
        }
    };

    let metadata = model.metadata();
    info!(
        path = %config.model_path.display(),
        input_shape = ?metadata.input_shape,
        output_shape = ?metadata.output_shape,
        input_dtype = %metadata.input_dtype,
        "model loaded"
    );
    metadata.check_label_count(labels.len())?;
    if metadata.input_dtype != "float32" {
        warn!(dtype = %metadata.input_dtype, "model input is not float32");
    }

    Ok(InferenceEngine::new(Arc::new(model)))
}

fn load_generator(config: &Config) -> Option<Arc<dyn TextGenerator>> {
    let Some(assistant_config) = config.assistant.clone() else {
        warn!("GEMINI_API_KEY not set, chat assistant disabled");
        return None;
    };
    info!(model = %assistant_config.model, "chat assistant enabled");
    match GeminiClient::new(assistant_config) {
        Ok(client) => Some(Arc::new(client) as Arc<dyn TextGenerator>),
        Err(err) => {
            error!(error = %err, "chat assistant disabled");
            None
        }
    }
}
