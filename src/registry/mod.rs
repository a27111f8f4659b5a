//! Extension registry: name -> descriptor, in registration order.

mod metadata;
mod params;
mod resolver;

pub use metadata::{
    BuiltinExtension, DescriptorFactory, ExtensionDescriptor, ExtensionParams, ParamKind,
    ParameterSchema,
};
pub use params::ResolvedParams;
pub use resolver::Resolver;

use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{validate_name, EngineError, Result};

/// Process-wide or local set of extension descriptors.
///
/// Registering the same contract twice is a no-op; registering a different
/// contract under a taken name fails.
#[derive(Default)]
pub struct ExtensionRegistry {
    descriptors: RwLock<Vec<Arc<ExtensionDescriptor>>>,
}

static GLOBAL: OnceLock<Arc<ExtensionRegistry>> = OnceLock::new();

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with every built-in extension.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        registry.register_builtins()?;
        Ok(registry)
    }

    /// The shared registry, seeded with built-ins on first use.
    pub fn global() -> Arc<ExtensionRegistry> {
        GLOBAL
            .get_or_init(|| {
                let registry = Self::new();
                if let Err(e) = registry.register_builtins() {
                    tracing::error!(error = %e, "failed to register built-in extensions");
                }
                Arc::new(registry)
            })
            .clone()
    }

    pub fn register_builtins(&self) -> Result<()> {
        let mut builtins = Vec::new();
        for builtin in inventory::iter::<BuiltinExtension> {
            builtins.push(builtin);
        }
        builtins.sort_by_key(|b| b.order);
        for builtin in builtins {
            self.register((builtin.factory)())?;
        }
        Ok(())
    }

    pub fn register(&self, descriptor: ExtensionDescriptor) -> Result<()> {
        validate_name("extension", &descriptor.name)?;
        for dep in &descriptor.dependencies {
            validate_name("extension", dep)?;
        }
        for param in &descriptor.parameters {
            if param.name.is_empty() {
                return Err(EngineError::InvalidParameter {
                    extension: descriptor.name.clone(),
                    parameter: String::new(),
                    reason: "parameter name must not be empty".to_string(),
                });
            }
        }
        // defaults must satisfy their own schema
        ResolvedParams::resolve(&descriptor, None)?;

        let mut descriptors = self.descriptors.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = descriptors.iter().find(|d| d.name == descriptor.name) {
            if existing.same_contract(&descriptor) {
                tracing::debug!(extension = %descriptor.name, "extension already registered");
                return Ok(());
            }
            return Err(EngineError::DuplicateExtension {
                name: descriptor.name,
            });
        }

        tracing::debug!(
            extension = %descriptor.name,
            dependencies = ?descriptor.dependencies,
            "extension registered"
        );
        descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ExtensionDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<ExtensionDescriptor>> {
        self.get(name).ok_or_else(|| EngineError::UnknownExtension {
            name: name.to_string(),
            required_by: None,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<ExtensionDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Execution order for `requested` plus all transitive dependencies.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        let snapshot = self.snapshot();
        Resolver::new(&snapshot).order(requested)
    }

    /// Extensions transitively depending on `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let snapshot = self.snapshot();
        Resolver::new(&snapshot).dependents(name)
    }
}
