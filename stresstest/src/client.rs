use std::io::Read;

use anyhow::{Context, Result};
use reqwest::{Response, StatusCode};

use crate::workload::Payload;

/// Speaks the repository's HTTP protocol.
pub struct RepositoryClient {
    pub base_url: String,
    /// Directory below the repository root that all stress files go into.
    pub directory: String,
    pub chunk_size: u64,
    pub client: reqwest::Client,
}

impl RepositoryClient {
    /// Creates the working directory, tolerating one left by an earlier run.
    pub async fn prepare(&self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/createDirectory", self.base_url))
            .form(&[("directory", String::new()), ("name", encode(&self.directory))])
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Ok(()),
            _ => Err(failure("createDirectory", response).await),
        }
    }

    /// Uploads the whole payload and returns the content hash the server recorded.
    pub async fn upload(&self, name: &str, mut payload: Payload) -> Result<String> {
        let chunks_needed = payload.len.div_ceil(self.chunk_size).max(1);

        let mut digest = None;
        for index in 0..chunks_needed {
            let response = self.send_chunk(name, index, chunks_needed, &mut payload).await?;
            digest = response
                .headers()
                .get("x-content-hash")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
        }
        digest.context("server did not report a content hash")
    }

    /// Sends about half of the chunks, then cancels the upload.
    pub async fn upload_and_cancel(&self, name: &str, mut payload: Payload) -> Result<()> {
        let chunks_needed = payload.len.div_ceil(self.chunk_size).max(2);

        for index in 0..chunks_needed / 2 {
            self.send_chunk(name, index, chunks_needed, &mut payload).await?;
        }
        self.post_form("cancelUpload", name).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.post_form("deleteFile", name).await
    }

    async fn send_chunk(
        &self,
        name: &str,
        index: u64,
        chunks_needed: u64,
        payload: &mut Payload,
    ) -> Result<Response> {
        let mut chunk = Vec::with_capacity(self.chunk_size as usize);
        payload.by_ref().take(self.chunk_size).read_to_end(&mut chunk)?;

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("x-current-directory", encode(&self.directory))
            .header("x-file-name", encode(name))
            .header("x-current-chunk", index.to_string())
            .header("x-chunks-needed", chunks_needed.to_string())
            .body(chunk)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(failure("upload", response).await);
        }
        Ok(response)
    }

    async fn post_form(&self, endpoint: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{endpoint}", self.base_url))
            .form(&[
                ("directory", encode(&self.directory)),
                ("name", encode(name)),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(failure(endpoint, response).await);
        }
        Ok(())
    }
}

/// Clients percent-encode names on top of the transport encoding.
fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

async fn failure(endpoint: &str, response: Response) -> anyhow::Error {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    anyhow::anyhow!("{endpoint} failed with {status}: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_like_encode_uri_component() {
        assert_eq!(encode("stress-00ff.bin"), "stress-00ff.bin");
        assert_eq!(encode("a b/ü"), "a%20b%2F%C3%BC");
    }
}
