mod config;
mod history;
mod inference;
mod pipeline;
mod routes;
#[cfg(test)]
mod test_support;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use config::AppConfig;
use inference::ImageModel;
use inference::labels::LabelSet;
use pipeline::classifier::ClassifierAdapter;
use pipeline::orchestrator::{BatchOrchestrator, Pipeline};
use pipeline::preprocess::Preprocessor;
use pipeline::validator::ImageValidator;
use routes::{ApiState, configure_routes};
use std::io;
use std::sync::Arc;

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    log::error!("{}: {}", context, err);
    io::Error::other(format!("{}: {}", context, err))
}

#[cfg(feature = "torch")]
fn load_model(config: &config::ModelConfig) -> io::Result<Arc<dyn ImageModel>> {
    let model = inference::torch::TorchModel::load(&config.name, &config.path)
        .map_err(|e| startup_error("Failed to load model at startup", e))?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "torch"))]
fn load_model(config: &config::ModelConfig) -> io::Result<Arc<dyn ImageModel>> {
    Err(startup_error(
        "No inference backend compiled in",
        format!(
            "cannot load {}; rebuild with `--features torch` and LIBTORCH set",
            config.path
        ),
    ))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = std::env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(|e| startup_error("Invalid configuration", e))?;

    let labels = LabelSet::load(&config.model.labels_path)
        .map_err(|e| startup_error("Failed to load class labels", e))?;

    let model = load_model(&config.model)?;
    log::info!("Model {} ready", model.name());

    let logger = history::open_logger(&config.history)
        .map_err(|e| startup_error("Failed to open prediction log", e))?;

    let pipeline = Pipeline::new(
        ImageValidator::new(&config.limits),
        Preprocessor::new(&config.preprocessing),
        ClassifierAdapter::new(model, Arc::new(labels)),
    );
    let orchestrator = BatchOrchestrator::new(
        Arc::new(pipeline),
        Arc::new(logger),
        config.limits.max_batch_size,
        config.limits.max_parallel_items,
    );
    let state = web::Data::new(ApiState::new(orchestrator, config.limits.clone()));

    let static_dir = config.server.static_dir.clone();
    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(state.clone())
            .configure(|cfg| configure_routes(cfg, static_dir.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
