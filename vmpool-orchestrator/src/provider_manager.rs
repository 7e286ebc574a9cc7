use std::sync::Arc;

use vmpool_providers::host_aliases::{FileHostAliases, MemoryHostAliases};
use vmpool_providers::{ComputeProvider, HostAliases, PoolRegistry};

use crate::config::DriverConfig;

pub struct ProviderManager;

impl ProviderManager {
    pub fn compute(config: &DriverConfig) -> anyhow::Result<Arc<dyn ComputeProvider>> {
        match config.provider.as_str() {
            #[cfg(feature = "provider-softlayer")]
            "softlayer" => {
                let Some(sl) = &config.softlayer else {
                    anyhow::bail!("softlayer provider selected without credentials");
                };
                let provider = vmpool_providers::softlayer::SoftLayerProvider::new(
                    sl.username.clone(),
                    sl.api_key.clone(),
                    sl.endpoint.clone(),
                )?;
                Ok(Arc::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(vmpool_providers::mock::MockCompute::new())),
            other => anyhow::bail!("unsupported or disabled provider '{}'", other),
        }
    }

    pub fn registry(config: &DriverConfig) -> anyhow::Result<Arc<dyn PoolRegistry>> {
        match config.vps_url.as_deref() {
            #[cfg(feature = "provider-softlayer")]
            Some(url) => Ok(Arc::new(vmpool_providers::vps::VpsPoolRegistry::new(url)?)),
            #[cfg(feature = "provider-mock")]
            None if config.provider == "mock" => {
                Ok(Arc::new(vmpool_providers::mock::MockPoolRegistry::new()))
            }
            _ => anyhow::bail!("VPS_URL is required for provider '{}'", config.provider),
        }
    }

    pub fn host_aliases(config: &DriverConfig) -> Arc<dyn HostAliases> {
        match &config.hosts_file {
            Some(path) => Arc::new(FileHostAliases::new(path.clone())),
            None => Arc::new(MemoryHostAliases::new()),
        }
    }
}

#[cfg(all(test, feature = "provider-softlayer"))]
mod tests {
    use super::*;
    use crate::config::{AgentOptions, SoftLayerConfig};
    use crate::waiter::WaitConfig;

    fn config(provider: &str) -> DriverConfig {
        DriverConfig {
            provider: provider.to_string(),
            softlayer: Some(SoftLayerConfig {
                username: "ops".into(),
                api_key: "key".into(),
                endpoint: None,
            }),
            vps_url: Some("http://pool.local".into()),
            waits: WaitConfig::default(),
            agent: AgentOptions::default(),
            hosts_file: None,
        }
    }

    #[test]
    fn builds_softlayer_stack() {
        let cfg = config("softlayer");
        assert!(ProviderManager::compute(&cfg).is_ok());
        assert!(ProviderManager::registry(&cfg).is_ok());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = ProviderManager::compute(&config("ovh")).err().unwrap();
        assert!(err.to_string().contains("ovh"));
    }

    #[test]
    fn missing_registry_url_is_rejected() {
        let mut cfg = config("softlayer");
        cfg.vps_url = None;
        assert!(ProviderManager::registry(&cfg).is_err());
    }
}
