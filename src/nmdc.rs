use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::{BiosampleRecord, SubmitEnv};
use crate::error::StudyError;

pub const DEV_API_BASE: &str = "https://api-dev.microbiomedata.org";
pub const TOKEN_ENV: &str = "NMDC_API_TOKEN";
const PAGE_SIZE: usize = 1000;
const URL_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const BIOSAMPLE_FIELDS: &str =
    "id,name,samp_name,description,gold_biosample_identifiers,insdc_biosample_identifiers,submitter_id";

pub trait BiosampleSource: Send + Sync {
    fn biosamples_for_study(&self, study_id: &str) -> Result<Vec<BiosampleRecord>, StudyError>;
}

pub trait MetadataSubmitter: Send + Sync {
    fn validate(&self, package: &Value) -> Result<(), StudyError>;
    fn submit(&self, package: &Value) -> Result<String, StudyError>;
}

/// Reachability of raw data download URLs.
pub trait UrlChecker: Send + Sync {
    /// Status of a HEAD request to `url`.
    fn head_status(&self, url: &str) -> Result<u16, StudyError>;
}

#[derive(Clone)]
pub struct NmdcHttpClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    resources: Vec<ApiBiosample>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiBiosample {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    samp_name: Option<String>,
    #[serde(default)]
    submitter_id: Option<String>,
    #[serde(default)]
    gold_biosample_identifiers: Vec<String>,
    #[serde(default)]
    insdc_biosample_identifiers: Vec<String>,
}

impl From<ApiBiosample> for BiosampleRecord {
    fn from(api: ApiBiosample) -> Self {
        let name = api
            .name
            .clone()
            .or_else(|| api.samp_name.clone())
            .unwrap_or_else(|| api.id.clone());
        let mut external_accessions = api.gold_biosample_identifiers;
        external_accessions.extend(api.insdc_biosample_identifiers);
        BiosampleRecord {
            id: api.id,
            name,
            samp_name: api.samp_name,
            submitter_id: api.submitter_id,
            external_accessions,
        }
    }
}

impl NmdcHttpClient {
    pub fn new(base_url: &str) -> Result<Self, StudyError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("nmdc-sm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StudyError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| StudyError::Http(err.to_string()))?;
        let token = std::env::var(TOKEN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Client for the submission environment; `prod` uses the configured base.
    pub fn for_env(env: SubmitEnv, prod_base: &str) -> Result<Self, StudyError> {
        match env {
            SubmitEnv::Dev => Self::new(DEV_API_BASE),
            SubmitEnv::Prod => Self::new(prod_base),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, StudyError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| StudyError::MissingCredential(TOKEN_ENV.to_string()))?;
        Ok(request.header(AUTHORIZATION, format!("Bearer {token}")))
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, StudyError>
    where
        F: FnMut() -> Result<RequestBuilder, StudyError>,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req()?.send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(StudyError::Http(err.to_string()));
                }
            }
        }
    }
}

fn check_status(response: Response) -> Result<Response, StudyError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "NMDC request failed".to_string());
    Err(StudyError::HttpStatus { status, message })
}

impl BiosampleSource for NmdcHttpClient {
    fn biosamples_for_study(&self, study_id: &str) -> Result<Vec<BiosampleRecord>, StudyError> {
        let url = format!("{}/nmdcschema/biosample_set", self.base_url);
        let filter = json!({ "associated_studies": study_id }).to_string();
        let page_size = PAGE_SIZE.to_string();
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self.send_with_retries(|| {
                let mut request = self.client.get(&url).query(&[
                    ("filter", filter.as_str()),
                    ("max_page_size", page_size.as_str()),
                    ("projection", BIOSAMPLE_FIELDS),
                ]);
                if let Some(token) = &page_token {
                    request = request.query(&[("page_token", token.as_str())]);
                }
                Ok(request)
            })?;
            let page: Page = check_status(response)?
                .json()
                .map_err(|err| StudyError::Http(err.to_string()))?;
            debug!(count = page.resources.len(), "biosample page received");
            records.extend(page.resources.into_iter().map(BiosampleRecord::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(records)
    }
}

impl MetadataSubmitter for NmdcHttpClient {
    fn validate(&self, package: &Value) -> Result<(), StudyError> {
        let url = format!("{}/metadata/json:validate", self.base_url);
        let response = self.send_with_retries(|| Ok(self.client.post(&url).json(package)))?;
        let body: Value = check_status(response)?
            .json()
            .map_err(|err| StudyError::Http(err.to_string()))?;
        match body.get("result").and_then(Value::as_str) {
            Some("errors") => Err(StudyError::HttpStatus {
                status: 422,
                message: body
                    .get("detail")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "validation failed".to_string()),
            }),
            _ => Ok(()),
        }
    }

    fn submit(&self, package: &Value) -> Result<String, StudyError> {
        let url = format!("{}/metadata/json:submit", self.base_url);
        let response = self.send_with_retries(|| self.authorized(self.client.post(&url).json(package)))?;
        check_status(response)?
            .text()
            .map_err(|err| StudyError::Http(err.to_string()))
    }
}

impl UrlChecker for NmdcHttpClient {
    fn head_status(&self, url: &str) -> Result<u16, StudyError> {
        let response = self
            .client
            .head(url)
            .timeout(URL_CHECK_TIMEOUT)
            .send()
            .map_err(|err| StudyError::Http(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_record_falls_back_to_samp_name() {
        let api: ApiBiosample = serde_json::from_value(json!({
            "id": "nmdc:bsm-11-abc",
            "samp_name": "S1 root",
            "gold_biosample_identifiers": ["gold:Gb0001"],
            "insdc_biosample_identifiers": ["biosample:SAMN01"]
        }))
        .unwrap();
        let record = BiosampleRecord::from(api);
        assert_eq!(record.name, "S1 root");
        assert_eq!(record.external_accessions, vec!["gold:Gb0001", "biosample:SAMN01"]);
    }
}
