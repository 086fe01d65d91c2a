//! One-shot artifact fetch: GET a URL and save the body under the
//! artifact cache directory. Local paths and `file://` URLs bypass the
//! network so tests and single-machine deployments need no HTTP server.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid artifact url: {0}")]
    InvalidUrl(String),
    #[error("http status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Last path segment of the URL, used as the cached file name.
fn artifact_file_name(url: &str) -> Result<&str, FetchError> {
    let path = url.split('?').next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != path => Ok(name),
        // A bare local path with no slash still names a file.
        _ if !path.is_empty() && !path.contains("://") => Ok(path),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

/// Fetch `url` into `dest_dir`, returning the saved path.
///
/// With `reuse_cached` set, an already-present file of the same name is
/// returned without touching the network.
pub async fn fetch_artifact(
    url: &str,
    dest_dir: &Path,
    reuse_cached: bool,
) -> Result<PathBuf, FetchError> {
    let name = artifact_file_name(url)?;
    let dest = dest_dir.join(name);

    if reuse_cached && dest.exists() {
        tracing::debug!(url, path = %dest.display(), "fetch: using cached artifact");
        return Ok(dest);
    }

    if let Some(local) = url.strip_prefix("file://") {
        std::fs::copy(local, &dest)?;
        return Ok(dest);
    }
    if !url.contains("://") {
        // Bare filesystem path.
        std::fs::copy(url, &dest)?;
        return Ok(dest);
    }

    tracing::info!(url, "fetch: downloading artifact");
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await?;
    tokio::fs::write(&dest, &body).await?;
    tracing::info!(url, bytes = body.len(), path = %dest.display(), "fetch: artifact saved");
    Ok(dest)
}
