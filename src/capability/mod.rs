//! Capabilities are the external tools a worker may invoke.
//!
//! A [`CapabilityRegistry`] knows how to construct each capability from
//! [`Credentials`]. At run start the registry instantiates every name the
//! role mapping references into a [`CapabilityPool`]; construction failures
//! are kept in the pool so the resolver can report what was dropped.

pub mod file_read;
pub mod file_write;
pub mod policy;
pub mod resolver;
pub mod web_search;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{CapabilityError, CapabilityErrorKind};

pub use file_read::{FILE_READ_CAPABILITY, FileReadCapability};
pub use file_write::{FILE_WRITE_CAPABILITY, FileWriteCapability};
pub use web_search::{SERPER_API_KEY, WEB_SEARCH_CAPABILITY, WebSearchCapability};

/// Invocable unit shared read-only by every worker (and run) that references it.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn invoke(&self, request: Value) -> Result<Value, CapabilityError>;
}

impl fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name())
            .finish()
    }
}

/// Credential keys read from the environment for built-in capabilities.
pub const CREDENTIAL_KEYS: &[&str] = &[SERPER_API_KEY];

/// Out-of-band secrets. Held in memory only; `Debug` prints key names.
#[derive(Clone, Default)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn from_env(keys: &[&str]) -> Self {
        let mut credentials = Self::default();
        for key in keys {
            if let Ok(value) = std::env::var(key) {
                credentials = credentials.with(*key, value);
            }
        }
        credentials
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn require(&self, capability: &str, key: &str) -> Result<&str, CapabilityError> {
        self.get(key)
            .ok_or_else(|| CapabilityError::missing_credential(capability, key))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub type CapabilityConstructor = Arc<
    dyn Fn(&Credentials) -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync,
>;

/// Name → constructor table.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    constructors: BTreeMap<String, CapabilityConstructor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin(workspace_root: PathBuf) -> Self {
        let mut registry = Self::new();
        registry.register(WEB_SEARCH_CAPABILITY, |credentials| {
            Ok(Arc::new(WebSearchCapability::from_credentials(credentials)?) as Arc<dyn Capability>)
        });
        let read_root = workspace_root.clone();
        registry.register(FILE_READ_CAPABILITY, move |_credentials| {
            Ok(Arc::new(FileReadCapability::new(read_root.clone())) as Arc<dyn Capability>)
        });
        registry.register(FILE_WRITE_CAPABILITY, move |_credentials| {
            Ok(Arc::new(FileWriteCapability::new(workspace_root.clone())) as Arc<dyn Capability>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Credentials) -> Result<Arc<dyn Capability>, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Builds each requested capability once. Failures are recorded, never
    /// replaced by a substitute.
    pub fn instantiate(&self, names: &BTreeSet<String>, credentials: &Credentials) -> CapabilityPool {
        let mut pool = CapabilityPool::default();
        for name in names {
            let built = match self.constructors.get(name) {
                Some(constructor) => constructor(credentials),
                None => Err(CapabilityError::new(
                    name.clone(),
                    CapabilityErrorKind::Unknown,
                    format!(
                        "no capability named '{}' is registered (known: {})",
                        name,
                        self.names().join(", ")
                    ),
                )),
            };
            match built {
                Ok(capability) => {
                    tracing::debug!(capability = name.as_str(), "capability instantiated");
                    pool.available.insert(name.clone(), capability);
                }
                Err(err) => {
                    tracing::warn!(
                        capability = name.as_str(),
                        kind = err.kind.label(),
                        error = %err,
                        "capability could not be instantiated"
                    );
                    pool.failures.insert(name.clone(), err);
                }
            }
        }
        pool
    }
}

/// Capabilities instantiated for one run.
#[derive(Default)]
pub struct CapabilityPool {
    available: BTreeMap<String, Arc<dyn Capability>>,
    failures: BTreeMap<String, CapabilityError>,
}

impl CapabilityPool {
    pub fn get(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        if let Some(capability) = self.available.get(name) {
            return Ok(capability.clone());
        }
        Err(self.failures.get(name).cloned().unwrap_or_else(|| {
            CapabilityError::new(
                name,
                CapabilityErrorKind::Unknown,
                "capability was never instantiated for this run",
            )
        }))
    }

    pub fn available_names(&self) -> Vec<&str> {
        self.available.keys().map(String::as_str).collect()
    }

    pub fn failures(&self) -> &BTreeMap<String, CapabilityError> {
        &self.failures
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_recorded_not_raised() {
        let registry = CapabilityRegistry::builtin(PathBuf::from("."));
        let names = [WEB_SEARCH_CAPABILITY, FILE_READ_CAPABILITY]
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        let pool = registry.instantiate(&names, &Credentials::default());
        assert_eq!(pool.available_names(), vec![FILE_READ_CAPABILITY]);
        let failure = pool
            .failures()
            .get(WEB_SEARCH_CAPABILITY)
            .expect("web search should fail without a key");
        assert_eq!(failure.kind, CapabilityErrorKind::MissingCredential);
        assert!(failure.message.contains(SERPER_API_KEY));
    }

    #[test]
    fn unknown_capability_names_fail_with_unknown_kind() {
        let registry = CapabilityRegistry::new();
        let names = BTreeSet::from(["telepathy".to_string()]);
        let pool = registry.instantiate(&names, &Credentials::default());
        let err = pool.get("telepathy").err().expect("unknown should fail");
        assert_eq!(err.kind, CapabilityErrorKind::Unknown);
    }

    #[test]
    fn credentials_ignore_blank_values_and_hide_them_from_debug() {
        let credentials = Credentials::default()
            .with("SERPER_API_KEY", "secret-value")
            .with("EMPTY", "   ");
        assert_eq!(credentials.get("SERPER_API_KEY"), Some("secret-value"));
        assert_eq!(credentials.get("EMPTY"), None);
        assert!(!format!("{credentials:?}").contains("secret-value"));
    }
}
