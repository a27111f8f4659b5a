use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extension::{ComputeContext, Extension, ExtensionData};

/// JSON type a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Number,
    Integer,
    String,
    Boolean,
    Array,
    Any,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::Integer => "integer",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Schema for a configurable parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub default: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParameterSchema {
    pub fn new(name: impl Into<String>, kind: ParamKind, default: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
            min: None,
            max: None,
        }
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// Parameter structs that describe their own schema.
/// Usually derived with `#[derive(ExtensionParams)]`.
pub trait ExtensionParams {
    fn parameter_schema() -> Vec<ParameterSchema>;
}

/// Name, dependencies, parameter schema and computation of one extension.
#[derive(Clone)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub dependencies: Vec<String>,
    pub parameters: Vec<ParameterSchema>,
    /// Bumped when the payload layout changes; stored entries with another
    /// version are recomputed.
    pub schema_version: u32,
    compute: Arc<dyn Extension>,
    // closures share a type name, so the id is what identifies a computation
    compute_id: TypeId,
    compute_type: &'static str,
}

impl fmt::Debug for ExtensionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("parameters", &self.parameters)
            .field("schema_version", &self.schema_version)
            .field("compute", &self.compute_type)
            .finish()
    }
}

struct Unimplemented;

impl Extension for Unimplemented {
    fn compute(&self, ctx: &ComputeContext<'_>) -> anyhow::Result<ExtensionData> {
        anyhow::bail!("extension `{}` has no computation", ctx.extension())
    }
}

impl ExtensionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            parameters: Vec::new(),
            schema_version: 1,
            compute: Arc::new(Unimplemented),
            compute_id: TypeId::of::<Unimplemented>(),
            compute_type: type_name::<Unimplemented>(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn add_parameter(mut self, param: ParameterSchema) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn with_params<P: ExtensionParams>(mut self) -> Self {
        self.parameters.extend(P::parameter_schema());
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_compute<E: Extension + 'static>(mut self, compute: E) -> Self {
        self.compute = Arc::new(compute);
        self.compute_id = TypeId::of::<E>();
        self.compute_type = type_name::<E>();
        self
    }

    /// Same as [`with_compute`](Self::with_compute) for closures, which only
    /// infer the right signature when the `Fn` bound is spelled out.
    pub fn with_compute_fn<F>(self, compute: F) -> Self
    where
        F: Fn(&ComputeContext<'_>) -> anyhow::Result<ExtensionData> + Send + Sync + 'static,
    {
        self.with_compute(compute)
    }

    pub fn compute(&self) -> &Arc<dyn Extension> {
        &self.compute
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Two descriptors with the same contract may be registered twice.
    pub fn same_contract(&self, other: &Self) -> bool {
        self.name == other.name
            && self.dependencies == other.dependencies
            && self.parameters == other.parameters
            && self.schema_version == other.schema_version
            && self.compute_id == other.compute_id
    }
}

/// Factory producing a built-in descriptor.
pub type DescriptorFactory = fn() -> ExtensionDescriptor;

/// Built-in extension submitted through `inventory`. Lower `order` registers first.
pub struct BuiltinExtension {
    pub order: u32,
    pub factory: DescriptorFactory,
}

inventory::collect!(BuiltinExtension);
