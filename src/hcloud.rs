//! Hetzner Cloud implementation of the provider interface.
//!
//! Thin reqwest client over the provider's HTTPS API. Only the calls the
//! lifecycle needs are implemented; pagination is capped at one page of 50,
//! which covers the catalog sizes this tool encounters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use tokio::time::sleep;

use crate::provider::{
    CloudProvider, CreateMachine, CreatedMachine, DatacenterInfo, ImageCandidate, MachineRef,
    ProviderError, ServerTypeCandidate, SshKeyRef,
};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ACTION_POLL_LIMIT: u32 = 120;
const PER_PAGE: u32 = 50;

/// Hetzner Cloud API client.
#[derive(Clone, Debug)]
pub struct HcloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HcloudClient {
    /// Creates a client authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] when the HTTP client cannot be
    /// constructed.
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base_url: API_BASE.to_owned(),
            token: token.into(),
        })
    }

    /// Overrides the API base URL. Primarily for tests.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ApiErrorResponse>().await {
            Ok(body) => body.error.message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_owned(),
        };
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }

    async fn wait_for_action(&self, action_id: i64) -> Result<(), ProviderError> {
        for _ in 0..ACTION_POLL_LIMIT {
            let response: ActionResponse = self
                .get_json(&format!("/actions/{action_id}"), &[])
                .await?;
            match response.action.status.as_str() {
                "success" => return Ok(()),
                "error" => {
                    return Err(ProviderError::Api {
                        status: 200,
                        message: format!("action {action_id} failed"),
                    });
                }
                _ => sleep(ACTION_POLL_INTERVAL).await,
            }
        }
        Err(ProviderError::Api {
            status: 200,
            message: format!("action {action_id} did not complete"),
        })
    }
}

#[async_trait]
impl CloudProvider for HcloudClient {
    async fn list_datacenters(&self) -> Result<Vec<DatacenterInfo>, ProviderError> {
        let response: DatacentersResponse = self
            .get_json("/datacenters", &[("per_page", PER_PAGE.to_string())])
            .await?;
        Ok(response
            .datacenters
            .into_iter()
            .map(|datacenter| DatacenterInfo {
                name: datacenter.name,
                location: datacenter.location.name,
                available_server_types: datacenter.server_types.available,
            })
            .collect())
    }

    async fn server_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError> {
        let response: ServerTypesResponse = self
            .get_json("/server_types", &[("name", name.to_owned())])
            .await?;
        Ok(response.server_types.into_iter().next().map(Into::into))
    }

    async fn server_type_by_id(
        &self,
        id: i64,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError> {
        match self
            .get_json::<ServerTypeResponse>(&format!("/server_types/{id}"), &[])
            .await
        {
            Ok(response) => Ok(Some(response.server_type.into())),
            Err(ProviderError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_images(
        &self,
        architecture: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ImageCandidate>, ProviderError> {
        let query = image_query(architecture, label_selector);
        let response: ImagesResponse = self.get_json("/images", &query).await?;
        Ok(response
            .images
            .into_iter()
            .map(|image| ImageCandidate {
                id: image.id,
                name: image.name.unwrap_or_default(),
                os_version: image.os_version.unwrap_or_default(),
                created: image.created,
                labels: image.labels,
            })
            .collect())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<SshKeyRef, ProviderError> {
        let body = CreateSshKeyBody {
            name,
            public_key,
            labels,
        };
        let response: SshKeyResponse = self.post_json("/ssh_keys", &body).await?;
        Ok(SshKeyRef {
            id: response.ssh_key.id,
            name: response.ssh_key.name,
        })
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("/ssh_keys/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Self::check(response).await.map(|_| ())
    }

    async fn create_server(
        &self,
        params: &CreateMachine,
    ) -> Result<Option<CreatedMachine>, ProviderError> {
        let body = CreateServerBody {
            name: &params.name,
            server_type: &params.server_type,
            image: params.image_id.to_string(),
            ssh_keys: vec![params.ssh_key.clone()],
            labels: &params.labels,
            location: &params.location,
            user_data: &params.user_data,
            start_after_create: true,
        };
        let response: CreateServerResponse = self.post_json("/servers", &body).await?;
        Ok(response.server.map(|server| CreatedMachine {
            id: server.id,
            ipv4: server
                .public_net
                .and_then(|net| net.ipv4)
                .and_then(|ipv4| ipv4.ip.parse::<Ipv4Addr>().ok()),
            created: server.created,
        }))
    }

    async fn server_by_name(&self, name: &str) -> Result<Option<MachineRef>, ProviderError> {
        let response: ServersResponse = self
            .get_json("/servers", &[("name", name.to_owned())])
            .await?;
        Ok(response
            .servers
            .into_iter()
            .next()
            .map(|server| MachineRef {
                id: server.id,
                name: server.name,
            }))
    }

    async fn delete_server(&self, id: i64) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("/servers/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let body: DeleteServerResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        self.wait_for_action(body.action.id).await
    }
}

/// Builds the image listing query. Multi-valued filters are repeated per
/// value; the API rejects comma-joined enum parameters.
fn image_query(architecture: &str, label_selector: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("type", "snapshot".to_owned()),
        ("type", "system".to_owned()),
        ("status", "available".to_owned()),
        ("architecture", architecture.to_owned()),
        ("per_page", PER_PAGE.to_string()),
    ];
    if let Some(selector) = label_selector {
        query.push(("label_selector", selector.to_owned()));
    }
    query
}

// Wire types. Field subsets of the provider's documented schemas.

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct DatacentersResponse {
    datacenters: Vec<WireDatacenter>,
}

#[derive(Deserialize)]
struct WireDatacenter {
    name: String,
    location: WireLocation,
    server_types: WireDatacenterServerTypes,
}

#[derive(Deserialize)]
struct WireLocation {
    name: String,
}

#[derive(Deserialize)]
struct WireDatacenterServerTypes {
    available: Vec<i64>,
}

#[derive(Deserialize)]
struct ServerTypesResponse {
    server_types: Vec<WireServerType>,
}

#[derive(Deserialize)]
struct ServerTypeResponse {
    server_type: WireServerType,
}

#[derive(Deserialize)]
struct WireServerType {
    id: i64,
    name: String,
    architecture: String,
    cpu_type: String,
    #[serde(default)]
    description: String,
}

impl From<WireServerType> for ServerTypeCandidate {
    fn from(wire: WireServerType) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            architecture: wire.architecture,
            cpu_kind: wire.cpu_type,
            description: wire.description,
        }
    }
}

#[derive(Deserialize)]
struct ImagesResponse {
    images: Vec<WireImage>,
}

#[derive(Deserialize)]
struct WireImage {
    id: i64,
    name: Option<String>,
    os_version: Option<String>,
    created: DateTime<Utc>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Serialize)]
struct CreateSshKeyBody<'a> {
    name: &'a str,
    public_key: &'a str,
    labels: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct SshKeyResponse {
    ssh_key: WireSshKey,
}

#[derive(Deserialize)]
struct WireSshKey {
    id: i64,
    name: String,
}

#[derive(Serialize)]
struct CreateServerBody<'a> {
    name: &'a str,
    server_type: &'a str,
    image: String,
    ssh_keys: Vec<String>,
    labels: &'a HashMap<String, String>,
    location: &'a str,
    user_data: &'a str,
    start_after_create: bool,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: Option<WireServer>,
}

#[derive(Deserialize)]
struct ServersResponse {
    servers: Vec<WireServer>,
}

#[derive(Deserialize)]
struct WireServer {
    id: i64,
    name: String,
    created: Option<DateTime<Utc>>,
    public_net: Option<WirePublicNet>,
}

#[derive(Deserialize)]
struct WirePublicNet {
    ipv4: Option<WireIpv4>,
}

#[derive(Deserialize)]
struct WireIpv4 {
    ip: String,
}

#[derive(Deserialize)]
struct DeleteServerResponse {
    action: WireAction,
}

#[derive(Deserialize)]
struct ActionResponse {
    action: WireAction,
}

#[derive(Deserialize)]
struct WireAction {
    id: i64,
    status: String,
}
