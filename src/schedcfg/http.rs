//! HTTP client for the scheduler-configuration endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{SchedulerConfigApi, SchedulerConfigError, SchedulerConfiguration};

/// Talks JSON to a scheduler-configuration endpoint such as the one the
/// kube-scheduler-simulator exposes. GET returns the current configuration,
/// POST replaces it; 200/202/204 all count as an accepted update.
#[derive(Debug, Clone)]
pub struct HttpSchedulerConfig {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchedulerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SchedulerConfigApi for HttpSchedulerConfig {
    async fn get(&self) -> Result<SchedulerConfiguration, SchedulerConfigError> {
        let response = self.client.get(&self.base_url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(SchedulerConfigError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    async fn put(&self, config: &SchedulerConfiguration) -> Result<(), SchedulerConfigError> {
        let response = self.client.post(&self.base_url).json(config).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(SchedulerConfigError::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }
}
