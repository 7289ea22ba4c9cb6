use std::{
    env,
    path::{Path, PathBuf},
};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Sets up the global tracing subscriber, `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn download_file(url: &str, path: &Path) -> Result<usize, DownloadError> {
    info!(%url, path = %path.display(), "downloading");

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        if let Ok(auth_value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            header_map.insert(AUTHORIZATION, auth_value);
        }
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let request_error = |source| DownloadError::Request {
        url: url.to_string(),
        source,
    };
    let response = reqwest::Client::new()
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(request_error)?;

    if !response.status().is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await.map_err(request_error)?;
    write_atomically(path, &bytes)
        .await
        .map_err(|source| DownloadError::Write {
            path: path.display().to_string(),
            source,
        })?;
    Ok(bytes.len())
}

/// Writes to `<path>.part` and renames it into place, so an interrupted
/// write never leaves a truncated file at `path`.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    if let Err(err) = tokio::fs::write(&partial, bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, path).await
}

/// Fetches `path` from `url` when the file is missing. Returns whether the
/// file exists afterwards; failures are logged, not raised.
pub async fn ensure_file(path: &Path, url: Option<&str>) -> bool {
    if path.exists() {
        return true;
    }
    let Some(url) = url else {
        return false;
    };
    match download_file(url, path).await {
        Ok(size) => {
            info!(path = %path.display(), size, "downloaded");
            true
        }
        Err(err) => {
            error!(error = %err, "download failed");
            false
        }
    }
}

/// Which artifacts are on disk after [`prepare_model_files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFiles {
    pub model: bool,
    pub class_list: bool,
}

/// Makes sure the model directory exists and pulls missing artifacts from
/// their configured URLs. A missing model only degrades the service; a
/// missing class list is reported so startup can stop.
pub async fn prepare_model_files(config: &Config) -> ModelFiles {
    info!("checking model files");
    if let Some(dir) = config.model_path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            error!(error = %err, dir = %dir.display(), "cannot create model directory");
        }
    }
    let files = ModelFiles {
        model: ensure_file(&config.model_path, config.model_url.as_deref()).await,
        class_list: ensure_file(&config.class_list_path, config.class_list_url.as_deref()).await,
    };
    if !files.model {
        warn!(path = %config.model_path.display(), "model artifact missing");
    }
    if !files.class_list {
        error!(path = %config.class_list_path.display(), "class list missing");
    }
    files
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::labels::ClassLabels;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}_{}", std::process::id()))
    }

    #[tokio::test]
    async fn atomic_write_replaces_target_without_leftovers() {
        let dir = scratch_dir("atomic_write");
        let path = dir.join("frozen_graph.pb");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&path, b"old").await.unwrap();

        write_atomically(&path, b"new graph bytes").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"new graph bytes");
        assert!(!dir.join("frozen_graph.pb.part").exists());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn failed_class_list_download_is_reported_and_not_loadable() {
        let dir = scratch_dir("bootstrap");
        let vars: HashMap<&str, String> = [
            ("MODEL_PATH", dir.join("frozen_graph.pb").display().to_string()),
            ("CLASS_LIST_PATH", dir.join("class_list.txt").display().to_string()),
            ("CLASS_LIST_URL", "http://127.0.0.1:9/class_list.txt".to_string()),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let files = prepare_model_files(&config).await;

        assert_eq!(
            files,
            ModelFiles {
                model: false,
                class_list: false
            }
        );
        assert!(dir.exists());
        assert!(ClassLabels::load(&config.class_list_path).is_err());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn existing_file_is_left_alone() {
        let path = std::env::temp_dir().join(format!("class_list_{}.txt", std::process::id()));
        tokio::fs::write(&path, "benign\n").await.unwrap();

        assert!(ensure_file(&path, Some("http://127.0.0.1:9/never-called")).await);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "benign\n");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_without_url_is_reported() {
        let path = Path::new("/nonexistent/dir/frozen_graph.pb");
        assert!(!ensure_file(path, None).await);
    }

    #[tokio::test]
    async fn failed_download_is_reported_not_raised() {
        let path = std::env::temp_dir().join(format!("missing_model_{}.pb", std::process::id()));
        assert!(!ensure_file(&path, Some("http://127.0.0.1:9/model.pb")).await);
        assert!(!path.exists());
    }
}
