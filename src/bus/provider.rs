//! Provider selection and the bus factory.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use super::role::BrokerRole;
use super::{BusError, MessageBus, Result};

/// Known bus providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Coordinator/worker broker in this process tree.
    Native,
}

impl Provider {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "native" => Ok(Self::Native),
            other => Err(BusError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Native => "native",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which provider to create, by name or by URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    /// Provider name, e.g. `"native"`.
    pub provider: Option<String>,
    /// Connection URL; its scheme names the provider, e.g. `"native:"`.
    pub url: Option<String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            provider: Some(Provider::Native.name().to_string()),
            url: None,
        }
    }
}

impl ProviderOptions {
    /// Options naming a provider explicitly.
    pub fn named(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            url: None,
        }
    }

    /// Options from a connection URL; the scheme is the provider.
    pub fn parse(url: &str) -> Self {
        Self {
            provider: scheme(url).map(str::to_string),
            url: Some(url.to_string()),
        }
    }

    /// Options with neither provider nor URL.
    pub fn empty() -> Self {
        Self {
            provider: None,
            url: None,
        }
    }

    /// Pick the provider. A URL scheme takes precedence over the name.
    pub fn resolve(&self) -> Result<Provider> {
        let name = self
            .url
            .as_deref()
            .and_then(scheme)
            .or(self.provider.as_deref())
            .ok_or(BusError::MissingProvider)?;
        Provider::from_name(name)
    }
}

fn scheme(url: &str) -> Option<&str> {
    url.split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

/// Create the bus for `options`, bound to this process's broker role.
///
/// Must be called from within a tokio runtime.
pub fn create(options: &ProviderOptions, role: Arc<dyn BrokerRole>) -> Result<Box<dyn MessageBus>> {
    match options.resolve()? {
        Provider::Native => {
            #[cfg(feature = "native")]
            {
                let bus = super::native::NativeBus::new(role);
                info!(provider = "native", "Message bus initialized");
                Ok(Box::new(bus))
            }

            #[cfg(not(feature = "native"))]
            {
                let _ = role;
                info!(provider = "native", "Native provider not compiled in");
                Err(BusError::UnknownProvider(
                    "native (requires the 'native' feature)".to_string(),
                ))
            }
        }
    }
}
