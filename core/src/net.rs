use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentDescription {
    pub length: Option<u64>,
    pub accept_ranges: bool,
}

impl ContentDescription {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn resumable(&self) -> bool {
        self.accept_ranges && self.length.map(|length| length > 0).unwrap_or(false)
    }
}

pub trait NetClient: Send + Sync {
    /// Never fails: an unreachable resource is reported as unknown and not
    /// resumable.
    fn probe(&self, task: &Task) -> ContentDescription;

    fn open(&self, task: &Task, offset: Option<u64>) -> CoreResult<Box<dyn Read + Send>>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(config: &EngineConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .redirect(Policy::limited(config.max_redirects))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn try_probe(&self, task: &Task) -> CoreResult<ContentDescription> {
        let resp = self
            .client
            .head(task.url())
            .header(RANGE, HeaderValue::from_static("bytes=0-"))
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let headers = resp.headers();
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|length| *length > 0);
        let accept_ranges = length.is_some()
            && match headers
                .get(ACCEPT_RANGES)
                .and_then(|value| value.to_str().ok())
            {
                Some(value) => !value.trim().eq_ignore_ascii_case("none"),
                None => headers.contains_key(CONTENT_RANGE),
            };
        Ok(ContentDescription {
            length,
            accept_ranges,
        })
    }
}

impl NetClient for ReqwestNetClient {
    fn probe(&self, task: &Task) -> ContentDescription {
        match self.try_probe(task) {
            Ok(description) => description,
            Err(err) => {
                debug!(task = %task.id(), error = %err, "can't get content length");
                ContentDescription::unknown()
            }
        }
    }

    fn open(&self, task: &Task, offset: Option<u64>) -> CoreResult<Box<dyn Read + Send>> {
        let mut request = self.client.get(task.url());
        if let Some(offset) = offset {
            let value = HeaderValue::from_str(&format!("bytes={}-", offset))
                .map_err(|err| CoreError::Network(err.to_string()))?;
            request = request.header(RANGE, value);
        }
        let resp: Response = request
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
            });
        }
        if offset.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(CoreError::RangeNotSatisfied {
                status: status.as_u16(),
            });
        }
        Ok(Box::new(resp))
    }
}
