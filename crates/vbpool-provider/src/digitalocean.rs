use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::{session_host, ProviderAccountConfig, VmProvider};
use vbpool_common::types::VmDescriptor;

const API_BASE: &str = "https://api.digitalocean.com/v2";
const PROVIDER_ID: &str = "DO";
const DEFAULT_SIZE: &str = "s-2vcpu-4gb";
const DEFAULT_LARGE_SIZE: &str = "c-4";
/// Droplet rebuilds take noticeably longer than Hetzner's.
const MIN_RETRIES: i32 = 20;
const PAGE_SIZE: u32 = 100;

pub struct DigitalOceanProvider {
    client: Client,
    config: ProviderAccountConfig,
    size: String,
    large_size: String,
}

impl DigitalOceanProvider {
    pub fn new(config: ProviderAccountConfig) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;
        let size = config.size.clone().unwrap_or_else(|| DEFAULT_SIZE.into());
        let large_size = config
            .large_size
            .clone()
            .unwrap_or_else(|| DEFAULT_LARGE_SIZE.into());
        Ok(Self {
            client,
            config,
            size,
            large_size,
        })
    }

    async fn call_api(
        &self,
        method: Method,
        path: &str,
        vmid: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{API_BASE}{path}");
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.config.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                provider: PROVIDER_ID,
                vmid: vmid.unwrap_or_default().to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Http {
                provider: PROVIDER_ID,
                status: status.as_u16(),
                body,
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|_| ProviderError::MalformedResponse {
            provider: PROVIDER_ID,
            field: "body",
        })
    }

    async fn droplet_action(&self, vmid: &str, body: Value) -> Result<Value> {
        self.call_api(
            Method::POST,
            &format!("/droplets/{vmid}/actions"),
            Some(vmid),
            Some(body),
        )
        .await
    }

    fn map_droplet(&self, droplet: &Value) -> Option<VmDescriptor> {
        let id = droplet.get("id")?.as_i64()?.to_string();
        let name = droplet.get("name").and_then(Value::as_str)?;
        let networks = droplet.get("networks")?.get("v4")?.as_array()?;
        let ip_of = |kind: &str| {
            networks
                .iter()
                .find(|n| n.get("type").and_then(Value::as_str) == Some(kind))
                .and_then(|n| n.get("ip_address"))
                .and_then(Value::as_str)
        };
        // Droplets report an empty network list until boot completes.
        let public_ip = ip_of("public")?;
        let private_ip = ip_of("private").unwrap_or_default();
        let state = droplet
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tags = droplet
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let creation_date = droplet
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Some(VmDescriptor {
            id,
            pass: name.to_string(),
            host: session_host(public_ip, &self.config.host_domain),
            private_ip: private_ip.to_string(),
            state: state.to_string(),
            tags,
            creation_date,
            provider: PROVIDER_ID.to_string(),
            large: self.config.large,
            region: self.config.region.clone(),
        })
    }
}

#[async_trait::async_trait]
impl VmProvider for DigitalOceanProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn size(&self) -> &str {
        &self.size
    }

    fn large_size(&self) -> &str {
        &self.large_size
    }

    fn min_retries(&self) -> i32 {
        MIN_RETRIES
    }

    async fn start_vm(&self, name: &str) -> Result<String> {
        let size = if self.config.large {
            self.large_size()
        } else {
            self.size()
        };
        let body = json!({
            "name": name,
            "region": self.config.location,
            "size": size,
            "image": self.config.image,
            "ssh_keys": self.config.ssh_keys,
            "tags": [self.config.tag],
        });

        let response = self.call_api(Method::POST, "/droplets", None, Some(body)).await?;
        let id = response
            .get("droplet")
            .and_then(|d| d.get("id"))
            .and_then(Value::as_i64)
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "droplet.id",
            })?;
        Ok(id.to_string())
    }

    async fn terminate_vm(&self, vmid: &str) -> Result<()> {
        self.call_api(Method::DELETE, &format!("/droplets/{vmid}"), Some(vmid), None)
            .await?;
        Ok(())
    }

    /// DigitalOcean keeps the droplet name (and therefore the session
    /// credential) across reboots, so rotation is rename + rebuild.
    async fn reboot_vm(&self, vmid: &str) -> Result<()> {
        let new_name = vbpool_common::name::vm_name();
        self.droplet_action(vmid, json!({ "type": "rename", "name": new_name }))
            .await?;
        self.droplet_action(vmid, json!({ "type": "rebuild", "image": self.config.image }))
            .await?;
        Ok(())
    }

    async fn get_vm(&self, vmid: &str) -> Result<Option<VmDescriptor>> {
        let response = self
            .call_api(Method::GET, &format!("/droplets/{vmid}"), Some(vmid), None)
            .await?;
        let droplet = response
            .get("droplet")
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "droplet",
            })?;
        Ok(self.map_droplet(droplet))
    }

    async fn list_vms(&self, tag: &str) -> Result<Vec<VmDescriptor>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("/droplets?tag_name={tag}&page={page}&per_page={PAGE_SIZE}");
            let response = self.call_api(Method::GET, &path, None, None).await?;
            let batch = response
                .get("droplets")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .len();
            if let Some(droplets) = response.get("droplets").and_then(Value::as_array) {
                all.extend(droplets.iter().filter_map(|d| self.map_droplet(d)));
            }
            if (batch as u32) < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn power_on(&self, vmid: &str) -> Result<()> {
        self.droplet_action(vmid, json!({ "type": "power_on" })).await?;
        Ok(())
    }

    /// Droplet networking is fixed at create time; nothing to recover.
    async fn attach_to_network(&self, _vmid: &str) -> Result<()> {
        Ok(())
    }

    async fn update_snapshot(&self) -> Result<String> {
        let source = self.config.snapshot_source_vmid.as_deref().ok_or_else(|| {
            ProviderError::Config("snapshot_source_vmid is not configured".into())
        })?;
        let response = self
            .droplet_action(source, json!({ "type": "snapshot", "name": "vbpool golden image" }))
            .await?;
        let action_id = response
            .get("action")
            .and_then(|a| a.get("id"))
            .and_then(Value::as_i64)
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "action.id",
            })?;

        // Snapshots materialize asynchronously; report the newest one for
        // this droplet once the action is accepted.
        tracing::debug!(action_id, "Snapshot requested");
        let response = self
            .call_api(
                Method::GET,
                &format!("/droplets/{source}/snapshots?per_page=1"),
                Some(source),
                None,
            )
            .await?;
        let image_id = response
            .get("snapshots")
            .and_then(Value::as_array)
            .and_then(|s| s.last())
            .and_then(|s| s.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_else(|| action_id.to_string());
        Ok(image_id)
    }
}
