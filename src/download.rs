use crate::error::{LauncherError, Result};
use futures::TryStreamExt;
use log::{info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::{path::Path, time::Duration};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::StreamReader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Thin HTTPS client shared by the runtime provisioner and the package
/// index lookup. Every request carries an explicit overall timeout.
#[derive(Clone, Debug)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!(
                "WebUILauncher/{} ({})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_NAME")
            ))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Streams `url` into `destination`. Data lands in a sibling temp file
    /// first so an interrupted download never looks like a cached one.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_file = destination.with_extension("download");

        match self.stream_into(url, &tmp_file, timeout).await {
            Ok(written) => {
                fs::rename(&tmp_file, destination).await?;
                info!("Downloaded {written} bytes from {url} to {destination:?}");
                Ok(written)
            }
            Err(err) => {
                warn!("Download of {url} failed: {err}");
                let _ = fs::remove_file(&tmp_file).await;
                Err(err)
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, timeout: Duration) -> Result<T> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn stream_into(&self, url: &str, tmp_file: &Path, timeout: Duration) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut file = fs::File::create(tmp_file).await?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|err| match err.get_ref() {
                Some(inner) if inner.is::<reqwest::Error>() => {
                    LauncherError::Network(err.to_string())
                }
                _ => LauncherError::Io(err),
            })?;
        file.flush().await?;
        Ok(written)
    }
}
