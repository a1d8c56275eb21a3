//! Explicit service registration.
//!
//! Services are registered by name through the builder; the partition
//! host instantiates them by tag. There is no reflective discovery: a
//! service type that was not registered does not exist.

use std::collections::HashMap;
use std::sync::Arc;

use super::{CounterService, DirectoryService, MapService, PrimitiveService};

type ServiceFactory = Arc<dyn Fn() -> Box<dyn PrimitiveService> + Send + Sync>;

/// Registry of service types available to partitions.
#[derive(Clone)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Start building a registry
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the built-in service types
    pub fn with_defaults() -> Self {
        Self::builder()
            .register("counter", || Box::new(CounterService::default()))
            .register("map", || Box::new(MapService::default()))
            .register("directory", || Box::new(DirectoryService::default()))
            .build()
    }

    /// Instantiate a service by type name
    pub fn create(&self, service_type: &str) -> Option<Box<dyn PrimitiveService>> {
        self.factories.get(service_type).map(|f| f())
    }

    /// Whether a type name is registered
    pub fn contains(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }
}

/// Builder for [`ServiceRegistry`].
pub struct ServiceRegistryBuilder {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistryBuilder {
    /// Register a service type by name
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PrimitiveService> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Finish the registry
    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            factories: self.factories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_builtin_types() {
        let registry = ServiceRegistry::with_defaults();
        assert!(registry.contains("counter"));
        assert!(registry.contains("map"));
        assert!(registry.contains("directory"));
        assert!(!registry.contains("lock"));
        assert!(registry.create("counter").is_some());
    }
}
