/// Model downloads for piper voices and whisper weights.
use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Stream `url` into `dest` unless it is already there. The body lands in a
/// `.part` sibling first so an interrupted download never looks complete.
pub async fn fetch_to(http: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Bad download path {}", dest.display()))?;
    let staging = dest.with_file_name(format!("{file_name}.part"));

    tracing::info!(%url, dest = %dest.display(), "downloading");
    let resp = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    if !resp.status().is_success() {
        return Err(anyhow!("Download of {url} failed (HTTP {})", resp.status()));
    }

    let mut file = tokio::fs::File::create(&staging)
        .await
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Download of {url} interrupted"))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&staging, dest)
        .await
        .with_context(|| format!("Failed to move download into {}", dest.display()))?;
    tracing::info!(bytes = written, dest = %dest.display(), "download complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_file_is_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("voice.onnx");
        std::fs::write(&dest, b"cached").unwrap();
        // unroutable URL: would fail if a request were made
        let http = reqwest::Client::new();
        fetch_to(&http, "http://127.0.0.1:9/never", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.bin");
        let http = reqwest::Client::new();
        assert!(fetch_to(&http, "http://127.0.0.1:9/never", &dest).await.is_err());
        assert!(!dest.exists());
    }
}
