use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{ProviderError, Result};
use crate::{session_host, ProviderAccountConfig, VmProvider};
use vbpool_common::types::VmDescriptor;

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const PROVIDER_ID: &str = "Hetzner";
const DEFAULT_SIZE: &str = "cpx11";
const DEFAULT_LARGE_SIZE: &str = "cpx31";
/// Hetzner rebuilds settle in well under ten seconds of probing.
const MIN_RETRIES: i32 = 8;
const PAGE_SIZE: u32 = 50;

pub struct HetznerProvider {
    client: Client,
    config: ProviderAccountConfig,
    size: String,
    large_size: String,
}

impl HetznerProvider {
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
            // DELETE and some actions return no payload.
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|_| ProviderError::MalformedResponse {
            provider: PROVIDER_ID,
            field: "body",
        })
    }

    fn map_server(&self, server: &Value) -> Option<VmDescriptor> {
        let id = server.get("id")?.as_i64()?.to_string();
        let name = server.get("name").and_then(Value::as_str)?;
        // No public IP yet means the record is incomplete; callers retry.
        let public_ip = server
            .get("public_net")
            .and_then(|n| n.get("ipv4"))
            .and_then(|n| n.get("ip"))
            .and_then(Value::as_str)?;
        let private_ip = server
            .get("private_net")
            .and_then(Value::as_array)
            .and_then(|nets| nets.first())
            .and_then(|n| n.get("ip"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let state = server
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tags = server
            .get("labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.as_str().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        let creation_date = server
            .get("created")
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
impl VmProvider for HetznerProvider {
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
        let server_type = if self.config.large {
            self.large_size()
        } else {
            self.size()
        };
        let mut body = json!({
            "name": name,
            "server_type": server_type,
            "image": self.config.image,
            "location": self.config.location,
            "ssh_keys": self.config.ssh_keys,
            "labels": { "app": self.config.tag },
            "start_after_create": true,
        });
        if let Some(network) = &self.config.network_id {
            body["networks"] = json!([network]);
        }

        let response = self.call_api(Method::POST, "/servers", None, Some(body)).await?;
        let id = response
            .get("server")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_i64)
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "server.id",
            })?;
        Ok(id.to_string())
    }

    async fn terminate_vm(&self, vmid: &str) -> Result<()> {
        self.call_api(Method::DELETE, &format!("/servers/{vmid}"), Some(vmid), None)
            .await?;
        Ok(())
    }

    /// Hetzner does not rotate credentials on reboot, so rotation is a
    /// rename (new password material) followed by a rebuild from the
    /// golden image.
    async fn reboot_vm(&self, vmid: &str) -> Result<()> {
        let new_name = vbpool_common::name::vm_name();
        self.call_api(
            Method::PUT,
            &format!("/servers/{vmid}"),
            Some(vmid),
            Some(json!({ "name": new_name })),
        )
        .await?;
        self.call_api(
            Method::POST,
            &format!("/servers/{vmid}/actions/rebuild"),
            Some(vmid),
            Some(json!({ "image": self.config.image })),
        )
        .await?;
        Ok(())
    }

    async fn get_vm(&self, vmid: &str) -> Result<Option<VmDescriptor>> {
        let response = self
            .call_api(Method::GET, &format!("/servers/{vmid}"), Some(vmid), None)
            .await?;
        let server = response
            .get("server")
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "server",
            })?;
        Ok(self.map_server(server))
    }

    async fn list_vms(&self, tag: &str) -> Result<Vec<VmDescriptor>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!(
                "/servers?label_selector=app={tag}&page={page}&per_page={PAGE_SIZE}"
            );
            let response = self.call_api(Method::GET, &path, None, None).await?;
            if let Some(servers) = response.get("servers").and_then(Value::as_array) {
                all.extend(servers.iter().filter_map(|s| self.map_server(s)));
            }
            match response
                .get("meta")
                .and_then(|m| m.get("pagination"))
                .and_then(|p| p.get("next_page"))
                .and_then(Value::as_u64)
            {
                Some(next) => page = next as u32,
                None => break,
            }
        }
        Ok(all)
    }

    async fn power_on(&self, vmid: &str) -> Result<()> {
        self.call_api(
            Method::POST,
            &format!("/servers/{vmid}/actions/poweron"),
            Some(vmid),
            None,
        )
        .await?;
        Ok(())
    }

    async fn attach_to_network(&self, vmid: &str) -> Result<()> {
        let Some(network) = &self.config.network_id else {
            return Ok(());
        };
        let res = self
            .call_api(
                Method::POST,
                &format!("/servers/{vmid}/actions/attach_to_network"),
                Some(vmid),
                Some(json!({ "network": network })),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            // Already attached reports as a conflict; the hook is idempotent.
            Err(ProviderError::Http { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update_snapshot(&self) -> Result<String> {
        let source = self.config.snapshot_source_vmid.as_deref().ok_or_else(|| {
            ProviderError::Config("snapshot_source_vmid is not configured".into())
        })?;
        let response = self
            .call_api(
                Method::POST,
                &format!("/servers/{source}/actions/create_image"),
                Some(source),
                Some(json!({ "type": "snapshot", "description": "vbpool golden image" })),
            )
            .await?;
        let id = response
            .get("image")
            .and_then(|i| i.get("id"))
            .and_then(Value::as_i64)
            .ok_or(ProviderError::MalformedResponse {
                provider: PROVIDER_ID,
                field: "image.id",
            })?;
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HetznerProvider {
        HetznerProvider::new(ProviderAccountConfig {
            token: "t0ken".into(),
            region: "US".into(),
            location: "ash".into(),
            large: false,
            tag: "vbrowserUS".into(),
            image: "123456".into(),
            ssh_keys: vec![],
            network_id: None,
            host_domain: "vb.example.com".into(),
            snapshot_source_vmid: None,
            size: None,
            large_size: None,
        })
        .unwrap()
    }

    #[test]
    fn map_server_projects_descriptor() {
        let server = json!({
            "id": 42,
            "name": "vb-deadbeef",
            "status": "running",
            "created": "2026-01-10T12:00:00+00:00",
            "labels": { "app": "vbrowserUS" },
            "public_net": { "ipv4": { "ip": "203.0.113.9" } },
            "private_net": [ { "ip": "10.0.0.4" } ],
        });

        let d = provider().map_server(&server).expect("complete record");
        assert_eq!(d.id, "42");
        assert_eq!(d.pass, "vb-deadbeef");
        assert_eq!(d.host, "203-0-113-9.vb.example.com/");
        assert_eq!(d.private_ip, "10.0.0.4");
        assert_eq!(d.state, "running");
        assert_eq!(d.tags, vec!["app=vbrowserUS".to_string()]);
        assert_eq!(d.provider, "Hetzner");
        assert_eq!(d.region, "US");
        assert!(d.creation_date.is_some());
    }

    #[test]
    fn map_server_without_public_ip_is_incomplete() {
        let server = json!({
            "id": 42,
            "name": "vb-deadbeef",
            "status": "initializing",
            "public_net": { "ipv4": null },
        });
        assert!(provider().map_server(&server).is_none());
    }

    #[test]
    fn sizes_fall_back_to_defaults() {
        let p = provider();
        assert_eq!(p.size(), "cpx11");
        assert_eq!(p.large_size(), "cpx31");
        assert!(p.min_retries() > 0);
    }
}
