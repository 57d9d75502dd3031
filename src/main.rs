use std::io::Write;
use std::sync::Arc;

use waste_classifier_api::classifier::{ModelState, CLASS_NAMES};
use waste_classifier_api::server::{app, AppState};
use waste_classifier_api::utils::{ensure_model_file, get_env};

fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

#[tokio::main]
async fn main() {
    let config = get_env();
    init_logging(config.debug);

    ensure_model_file(&config.model_path).await;
    let model = ModelState::init(&config.model_path);
    let state = Arc::new(AppState { model });

    let app = app(state, config.body_limit_bytes);

    log::info!(
        "Waste Classification API listening on http://0.0.0.0:{}",
        config.port
    );
    log::info!("Classes: {}", CLASS_NAMES.join(", "));

    axum::Server::bind(&format!("0.0.0.0:{}", config.port).parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
