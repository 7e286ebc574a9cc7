use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use vmpool_common::{CpiError, CpiResult, ErrorKind, PoolEntry, VmFilter, VmState};

use crate::PoolRegistry;

/// REST client for the pool registry service.
pub struct VpsPoolRegistry {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct StateUpdate {
    state: VmState,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_state: Option<VmState>,
}

impl VpsPoolRegistry {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building pool registry HTTP client")?;
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("pool registry URL must not be empty");
        }
        Ok(Self { client, base_url })
    }

    fn vms_url(&self) -> String {
        format!("{}/vms", self.base_url)
    }

    fn vm_url(&self, cid: u64) -> String {
        format!("{}/vms/{}", self.base_url, cid)
    }
}

fn transport(err: reqwest::Error) -> CpiError {
    CpiError::cloud(format!("pool registry request failed: {}", err))
}

fn status_error(op: &str, status: StatusCode, body: &str) -> CpiError {
    let kind = match status {
        StatusCode::NOT_FOUND => ErrorKind::VmNotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ErrorKind::PoolConflict,
        _ => ErrorKind::Cloud,
    };
    CpiError::new(
        kind,
        format!("pool registry {} failed: status={} body={}", op, status.as_u16(), body),
    )
}

#[async_trait]
impl PoolRegistry for VpsPoolRegistry {
    async fn find_by_filter(&self, filter: &VmFilter) -> CpiResult<Vec<PoolEntry>> {
        let url = format!("{}/filter", self.vms_url());
        let resp = self
            .client
            .post(&url)
            .json(filter)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        // The registry answers 404 for "no matching entries".
        if status == StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("find_by_filter", status, &text));
        }
        resp.json().await.map_err(transport)
    }

    async fn add_entry(&self, entry: &PoolEntry) -> CpiResult<()> {
        let resp = self
            .client
            .post(self.vms_url())
            .json(entry)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("add_entry", status, &text));
        }
        tracing::debug!(cid = entry.cid, state = entry.state.as_str(), "pool entry added");
        Ok(())
    }

    async fn update_state(
        &self,
        cid: u64,
        expected: Option<VmState>,
        next: VmState,
    ) -> CpiResult<()> {
        let url = format!("{}/state", self.vm_url(cid));
        let body = StateUpdate {
            state: next,
            expected_state: expected,
        };
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("update_state", status, &text));
        }
        Ok(())
    }

    async fn get_entry(&self, cid: u64) -> CpiResult<Option<PoolEntry>> {
        let resp = self
            .client
            .get(self.vm_url(cid))
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("get_entry", status, &text));
        }
        resp.json().await.map(Some).map_err(transport)
    }
}
