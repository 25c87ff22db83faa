//! Provider adapters: the pluggable edge of the pool controller.
//!
//! A [`VmProvider`] supplies the capability set the lifecycle loops
//! drive: provision, terminate, credential-rotating reboot, descriptor
//! fetch, tag-scoped listing and the staging recovery hooks. Two concrete
//! adapters are included (Hetzner Cloud, DigitalOcean); both speak their
//! provider's plain JSON API over `reqwest` and keep the name-as-password
//! contract behind this boundary: a VM's name is its session credential,
//! and "reboot" means rename + rebuild so the credential rotates.

pub mod digitalocean;
pub mod error;
pub mod hetzner;

use serde::{Deserialize, Serialize};

pub use error::{ProviderError, Result};
use vbpool_common::types::VmDescriptor;

/// Account + placement configuration for one adapter instance.
///
/// An adapter is constructed per pool, so placement (`location`), the pool
/// `tag` and the `region` label are fixed at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccountConfig {
    pub token: String,
    /// Pool region label carried into descriptors (e.g. "US").
    pub region: String,
    /// Provider-side placement slug (e.g. "ash", "nyc1").
    pub location: String,
    #[serde(default)]
    pub large: bool,
    /// Tag applied to every VM this pool owns.
    pub tag: String,
    /// Golden image the VMs boot (and rebuild) from.
    pub image: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Private network to attach during staging recovery, when the
    /// provider supports it.
    #[serde(default)]
    pub network_id: Option<String>,
    /// Wildcard-cert domain session hosts are published under.
    pub host_domain: String,
    /// VM the operational snapshot-refresh path images from.
    #[serde(default)]
    pub snapshot_source_vmid: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub large_size: Option<String>,
}

/// Capability set a concrete provider must furnish.
///
/// Every operation is fallible with [`ProviderError`]; callers treat all
/// failures as transient except [`ProviderError::NotFound`].
#[async_trait::async_trait]
pub trait VmProvider: Send + Sync {
    /// Stable provider identifier, the first component of the pool name.
    fn id(&self) -> &'static str;

    /// Instance type for regular pool VMs.
    fn size(&self) -> &str;

    /// Instance type for "Large" pools.
    fn large_size(&self) -> &str;

    /// Floor on staging attempts before the readiness probe is trusted,
    /// a proxy for this provider's reboot time at one attempt per second.
    fn min_retries(&self) -> i32;

    /// Provisions a VM named (and passworded) `name`, tagged with the
    /// pool's tag. Returns the provider id.
    async fn start_vm(&self, name: &str) -> Result<String>;

    /// Best-effort delete.
    async fn terminate_vm(&self, vmid: &str) -> Result<()>;

    /// Returns the VM to a clean boot with a rotated credential.
    async fn reboot_vm(&self, vmid: &str) -> Result<()>;

    /// Fetches the descriptor; `Ok(None)` while the record is incomplete
    /// (e.g. no public IP yet), `Err(NotFound)` when the VM is gone.
    async fn get_vm(&self, vmid: &str) -> Result<Option<VmDescriptor>>;

    /// Enumerates every VM bearing `tag`. Pagination is the adapter's
    /// concern.
    async fn list_vms(&self, tag: &str) -> Result<Vec<VmDescriptor>>;

    /// Idempotent staging recovery hook.
    async fn power_on(&self, vmid: &str) -> Result<()>;

    /// Idempotent staging recovery hook; a no-op where the provider fixes
    /// networking at create time.
    async fn attach_to_network(&self, vmid: &str) -> Result<()>;

    /// Operational maintenance: images the snapshot source VM and returns
    /// the new image id. Not on the hot path.
    async fn update_snapshot(&self) -> Result<String>;
}

/// Build an adapter from its kind string.
pub fn build_provider(
    kind: &str,
    config: ProviderAccountConfig,
) -> Result<Box<dyn VmProvider>> {
    match kind {
        "hetzner" => Ok(Box::new(hetzner::HetznerProvider::new(config)?)),
        "digitalocean" => Ok(Box::new(digitalocean::DigitalOceanProvider::new(config)?)),
        _ => Err(ProviderError::UnsupportedProvider(kind.to_string())),
    }
}

/// Session host published for a VM: hyphenated public IP under the
/// wildcard domain, path-terminated so the probe's `/health` substitution
/// lands on the root path.
pub(crate) fn session_host(public_ip: &str, host_domain: &str) -> String {
    format!("{}.{}/", public_ip.replace('.', "-"), host_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderAccountConfig {
        ProviderAccountConfig {
            token: "t0ken".into(),
            region: "US".into(),
            location: "ash".into(),
            large: false,
            tag: "vbrowserUS".into(),
            image: "ubuntu-22.04".into(),
            ssh_keys: vec![],
            network_id: None,
            host_domain: "vb.example.com".into(),
            snapshot_source_vmid: None,
            size: None,
            large_size: None,
        }
    }

    #[test]
    fn session_host_hyphenates_ip_and_keeps_path_separator() {
        assert_eq!(
            session_host("203.0.113.9", "vb.example.com"),
            "203-0-113-9.vb.example.com/"
        );
    }

    #[test]
    fn build_provider_rejects_unknown_kind() {
        let err = build_provider("openstack", config()).err().unwrap();
        assert!(matches!(err, ProviderError::UnsupportedProvider(_)));
    }

    #[test]
    fn build_provider_knows_both_adapters() {
        assert_eq!(build_provider("hetzner", config()).unwrap().id(), "Hetzner");
        assert_eq!(
            build_provider("digitalocean", config()).unwrap().id(),
            "DO"
        );
    }
}
