//! Discovery of the hosts that make up a deployment.

use crate::config::ContentType;
use crate::host::HostDescription;
use crate::request::{ArangoRequest, ArangoResponse, RequestType, SYSTEM_DATABASE};
use crate::vpack::{self, Value};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const ENDPOINTS_PATH: &str = "/_api/cluster/endpoints";

#[derive(Deserialize)]
struct EndpointsBody {
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    endpoint: String,
}

pub fn endpoints_request() -> ArangoRequest {
    ArangoRequest::new(SYSTEM_DATABASE, RequestType::Get, ENDPOINTS_PATH)
}

/// Extracts the host list from a response to [`endpoints_request`].
pub fn parse_endpoints(response: &ArangoResponse, content_type: ContentType) -> Result<Vec<HostDescription>> {
    if !response.is_success() {
        return Err(anyhow!(
            "{ENDPOINTS_PATH} answered with response code {}",
            response.response_code
        ));
    }
    let endpoints = match content_type {
        ContentType::Json => {
            let body: EndpointsBody = serde_json::from_slice(&response.body)
                .context("Failed to parse the endpoints response as json")?;
            body.endpoints
                .into_iter()
                .map(|endpoint| endpoint.endpoint)
                .collect::<Vec<_>>()
        }
        ContentType::Vpack => {
            let (body, _) = vpack::decode(&response.body)
                .context("Failed to parse the endpoints response as velocypack")?;
            body.get("endpoints")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("endpoints response has no endpoints array"))?
                .iter()
                .map(|endpoint| {
                    endpoint
                        .get("endpoint")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .ok_or_else(|| anyhow!("endpoint entry {endpoint:?} has no endpoint field"))
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let hosts = endpoints
        .iter()
        .map(|endpoint| HostDescription::from_endpoint(endpoint))
        .collect::<Result<Vec<_>>>()?;
    if hosts.is_empty() {
        return Err(anyhow!("endpoints response listed no hosts"));
    }
    Ok(hosts)
}
