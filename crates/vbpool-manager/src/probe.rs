use chrono::Utc;
use std::time::Duration;

use vbpool_common::types::Environment;

/// Upper bound on `now - boot_timestamp` for a production VM to count as
/// freshly booted.
///
/// The inherited behavior compares seconds against a value that is
/// numerically 60,000, ambiguous between 60 s (`60 * 1000` ms pasted into
/// a seconds comparison) and 1,000 minutes. The bound is kept verbatim as
/// the default; deployments wanting a tighter gate override it via
/// [`ReadinessProbe::with_boot_age_bound`].
pub const READY_BOOT_AGE_BOUND_SECS: i64 = 60_000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP reachability probe for a staging VM's health endpoint.
///
/// The body is the VM's boot time in Unix epoch seconds. In development
/// any successful response is ready; in production the boot must also be
/// recent. Any failure (network, timeout, non-2xx, unparseable body in
/// production) counts as not ready.
pub struct ReadinessProbe {
    client: reqwest::Client,
    environment: Environment,
    boot_age_bound_secs: i64,
}

impl ReadinessProbe {
    pub fn new(environment: Environment) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            environment,
            boot_age_bound_secs: READY_BOOT_AGE_BOUND_SECS,
        })
    }

    pub fn with_boot_age_bound(mut self, secs: i64) -> Self {
        self.boot_age_bound_secs = secs;
        self
    }

    pub async fn check(&self, host: &str) -> bool {
        let url = health_url(host);
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return false,
        };
        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => return false,
        };
        self.accepts_body(&body, Utc::now().timestamp())
    }

    fn accepts_body(&self, body: &str, now_secs: i64) -> bool {
        if !self.environment.is_production() {
            return true;
        }
        match body.trim().parse::<i64>() {
            Ok(boot_secs) => now_secs - boot_secs < self.boot_age_bound_secs,
            Err(_) => false,
        }
    }
}

/// Health URL for a session host: the first `/` becomes `/health`, the
/// whole thing is served over https. Hosts are path-terminated
/// (`<label>.<domain>/`), so this lands on `/health` at the root.
pub fn health_url(host: &str) -> String {
    format!("https://{}", host.replacen('/', "/health", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_substitutes_first_path_separator() {
        assert_eq!(
            health_url("203-0-113-9.vb.example.com/"),
            "https://203-0-113-9.vb.example.com/health"
        );
    }

    #[test]
    fn production_gates_on_boot_age() {
        let probe = ReadinessProbe::new(Environment::Production)
            .unwrap()
            .with_boot_age_bound(60);
        let now = 1_750_000_000;
        assert!(probe.accepts_body(&(now - 10).to_string(), now));
        assert!(!probe.accepts_body(&(now - 61).to_string(), now));
        assert!(!probe.accepts_body("not-a-timestamp", now));
        assert!(!probe.accepts_body("", now));
    }

    #[test]
    fn development_accepts_any_successful_body() {
        let probe = ReadinessProbe::new(Environment::Development).unwrap();
        assert!(probe.accepts_body("not-a-timestamp", 0));
        assert!(probe.accepts_body("12345", 0));
    }

    #[test]
    fn default_bound_is_the_inherited_value() {
        assert_eq!(READY_BOOT_AGE_BOUND_SECS, 60_000);
    }
}
