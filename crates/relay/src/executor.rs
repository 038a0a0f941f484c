//! One-shot GraphQL operations over HTTP.

use {
    embed_relay_protocol::{GraphQLRequest, Headers, OperationRequest, Outbound},
    reqwest::{
        Client,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    error::{Context, Result},
    frame::FrameTarget,
};

const CONTENT_TYPE: &str = "content-type";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Caller headers with `content-type: application/json` added unless some
/// casing of `content-type` is already present.
pub fn with_content_type(headers: Option<Headers>) -> Headers {
    let mut headers = headers.unwrap_or_default();
    if !headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE))
    {
        headers.insert(CONTENT_TYPE.into(), JSON_CONTENT_TYPE.into());
    }
    headers
}

/// Executes queries and mutations against the backend HTTP endpoint.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    client: Client,
    endpoint: String,
}

impl OperationExecutor {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client for operation executor")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the request and parse the body as JSON.
    ///
    /// The status code is not inspected; GraphQL servers put errors in the
    /// body and the widget renders whatever comes back.
    pub async fn fetch(&self, request: &GraphQLRequest, headers: Option<&Headers>) -> Result<Value> {
        let headers = with_content_type(headers.cloned());
        let mut header_map = HeaderMap::with_capacity(headers.len());
        for (name, value) in &headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name:?}"))?;
            header_map.append(header_name, header_value);
        }

        let body = serde_json::to_vec(request)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(header_map)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        debug!(status = %status, bytes = bytes.len(), "backend responded");
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Run one operation and post its response into the frame.
    ///
    /// Posts at most one message. Failures are logged and produce nothing.
    pub async fn execute(&self, operation: OperationRequest, target: FrameTarget) {
        let OperationRequest {
            correlation_id,
            request,
            headers,
        } = operation;

        match self.fetch(&request, headers.as_ref()).await {
            Ok(response) => {
                debug!(correlation_id = %correlation_id, "operation completed");
                target.post(&Outbound::OperationResponse {
                    correlation_id,
                    response,
                });
            },
            Err(e) => {
                warn!(
                    correlation_id = %correlation_id,
                    endpoint = %self.endpoint,
                    error = %e,
                    "operation failed, no response posted"
                );
            },
        }
    }
}
