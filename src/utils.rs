use std::{env, fs, path::Path};

use thiserror::Error;

pub const DEFAULT_MODEL_PATH: &str = "model/waste_classifier.pb";

pub struct Config {
    pub model_path: String,
    pub port: u16,
    pub debug: bool,
    pub body_limit_bytes: usize,
}

pub fn get_env() -> Config {
    let model_path = env::var("MODEL_PATH").unwrap_or_else(|_| DEFAULT_MODEL_PATH.into());

    let port = env::var("PORT")
        .unwrap_or_else(|_| "5000".into())
        .parse::<u16>()
        .expect("PORT must be a valid number between 0 and 65535");

    let debug = env::var("DEBUG")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let body_limit_bytes = {
        let mb = env::var("BODY_LIMIT_MB")
            .unwrap_or_else(|_| "5".into())
            .parse::<usize>()
            .expect("BODY_LIMIT_MB must be a valid integer");
        mb * 1024 * 1024
    };

    Config {
        model_path,
        port,
        debug,
        body_limit_bytes,
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server responded with {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// A missing artifact is not fatal; the service degrades to demo mode instead.
pub async fn ensure_model_file(path: &str) {
    if Path::new(path).exists() {
        return;
    }

    let url = match env::var("MODEL_URL") {
        Ok(url) => url,
        Err(_) => return,
    };

    log::info!("Downloading model from {}", url);
    if let Err(err) = download_file(&url, path).await {
        log::warn!(
            "Model download failed: {}. Continuing without a model artifact.",
            err
        );
    }
}

async fn download_file(url: &str, path: &str) -> Result<(), FetchError> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }

    let bytes = response.bytes().await?;
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, &bytes)?;

    Ok(())
}
