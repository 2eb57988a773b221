use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use cumulus_common::Host;

use crate::command::{AgentAnswer, AgentCommand};

/// Sends one command to one host and waits up to `timeout` for its answer.
///
/// Implementations never return an error: anything that prevents an answer
/// from arriving (timeout, connection refused, bad reply) becomes a failure
/// answer, so fan-out loops can treat every outcome uniformly.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, host: &Host, command: AgentCommand, timeout: Duration)
        -> AgentAnswer;
}

/// Dispatcher that POSTs commands to each host agent's HTTP endpoint.
pub struct HttpAgentDispatcher {
    client: reqwest::Client,
}

impl HttpAgentDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send(
        &self,
        host: &Host,
        command: &AgentCommand,
        timeout: Duration,
    ) -> Result<AgentAnswer, String> {
        let url = format!("http://{}/v1/commands", host.address);
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(command)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("agent returned {}", resp.status()));
        }

        resp.json::<AgentAnswer>().await.map_err(|e| e.to_string())
    }
}

impl Default for HttpAgentDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(
        &self,
        host: &Host,
        command: AgentCommand,
        timeout: Duration,
    ) -> AgentAnswer {
        match self.send(host, &command, timeout).await {
            Ok(answer) => answer,
            Err(details) => {
                warn!(
                    host_id = %host.host_id,
                    command = command.kind_name(),
                    error = %details,
                    "agent dispatch failed"
                );
                AgentAnswer::failure(details)
            }
        }
    }
}
