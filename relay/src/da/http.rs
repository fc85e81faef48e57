// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{DaClient, DaError, SubmissionReceipt};

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    block_number: u64,
}

#[derive(Debug, Deserialize)]
struct LatestBlockResponse {
    latest_block: u64,
}

#[derive(Debug, Deserialize)]
struct AppDataResponse {
    block: u64,
    extrinsics: Vec<String>,
}

/// Light-client HTTP API client. The light client is bound to a single application id, so
/// `app_id` is not part of the query URL.
#[derive(Debug, Clone)]
pub struct HttpDaClient {
    client: Client,
    base_url: String,
}

impl HttpDaClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, DaError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl DaClient for HttpDaClient {
    async fn submit(&self, _app_id: u32, blob: &[u8]) -> Result<SubmissionReceipt, DaError> {
        let data = STANDARD.encode(blob);
        let response = self
            .client
            .post(self.url("/v2/submit"))
            .json(&SubmitRequest {
                data: data.as_str(),
            })
            .send()
            .await?;
        let response = reject_unless_success(response).await?;
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|err| DaError::Decode(err.to_string()))?;
        Ok(SubmissionReceipt {
            block_number: body.block_number,
        })
    }

    async fn query_finality(&self) -> Result<u64, DaError> {
        let response = self.client.get(self.url("/v1/latest_block")).send().await?;
        let response = reject_unless_success(response).await?;
        let body: LatestBlockResponse = response
            .json()
            .await
            .map_err(|err| DaError::Decode(err.to_string()))?;
        Ok(body.latest_block)
    }

    async fn query_inclusion(&self, _app_id: u32, height: u64) -> Result<Vec<Vec<u8>>, DaError> {
        let response = self
            .client
            .get(self.url(format!("/v1/appdata/{height}").as_str()))
            .query(&[("decode", "true")])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(Vec::new()),
            // 400 is "not synced" and 401 is "processing block"; the block may still hold data.
            status @ (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) => {
                let message = response.text().await.unwrap_or_default();
                return Err(DaError::Unavailable(format!(
                    "block {height} not readable yet ({status}): {message}"
                )));
            }
            _ => {}
        }
        let response = reject_unless_success(response).await?;
        let body: AppDataResponse = response
            .json()
            .await
            .map_err(|err| DaError::Decode(err.to_string()))?;
        if body.block != height {
            return Err(DaError::Decode(format!(
                "asked for block {height}, light client answered for block {}",
                body.block
            )));
        }
        body.extrinsics
            .iter()
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|err| DaError::Decode(err.to_string()))
            })
            .collect()
    }
}

async fn reject_unless_success(response: reqwest::Response) -> Result<reqwest::Response, DaError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(DaError::Rejected {
        status: status.as_u16(),
        message,
    })
}
