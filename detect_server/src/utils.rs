//! Utility functions
//!
use std::{
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

/// Resolve the model file, downloading it into the cache directory if needed.
///
/// An explicitly given path that exists wins. Otherwise the model is looked up in the cache
/// under the file name of `url` and downloaded when missing.
pub async fn resolve_model_path(path: Option<&Path>, url: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = path {
        if path.exists() {
            return Ok(path.to_owned());
        }
        if url.is_none() {
            bail!("model file {} does not exist", path.display());
        }
    }

    let Some(url) = url else {
        bail!("neither a model path nor a model URL was given");
    };

    let filepath = match path {
        Some(path) => path.to_owned(),
        None => {
            let cache_dir = dirs::cache_dir()
                .context("no cache directory available")?
                .join(env!("CARGO_PKG_NAME"));
            std::fs::create_dir_all(&cache_dir)?;
            cache_dir.join(file_name_of(url)?)
        }
    };

    if !filepath.exists() {
        log::info!("Downloading model from {} to {}", url, filepath.display());
        download_file(&Client::new(), url, &filepath)
            .await
            .with_context(|| format!("failed to download {url}"))?;
    }

    Ok(filepath)
}

fn file_name_of(url: &str) -> Result<&str> {
    match url.split(['?', '#']).next().and_then(|u| u.rsplit('/').next()) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!("cannot derive a file name from {url}"),
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_file_name_of() -> Result<()> {
        assert_eq!(file_name_of("https://host/models/yolov8n.onnx")?, "yolov8n.onnx");
        assert_eq!(file_name_of("https://host/yolo.onnx?download=1")?, "yolo.onnx");
        assert!(file_name_of("https://host/models/").is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_existing_path_wins() -> Result<()> {
        let path = std::env::temp_dir().join("detect_server_resolve_model_test.onnx");
        std::fs::write(&path, b"onnx")?;

        let url = "http://unreachable.invalid/x.onnx";
        let resolved = resolve_model_path(Some(path.as_path()), Some(url)).await?;
        assert_eq!(resolved, path);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_model_without_url() {
        let path = Path::new("/nonexistent/model.onnx");
        assert!(resolve_model_path(Some(path), None).await.is_err());
        assert!(resolve_model_path(None, None).await.is_err());
    }
}
