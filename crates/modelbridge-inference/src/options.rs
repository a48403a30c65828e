//! Session options and execution-provider selection.
//!
//! Options arrive in the camelCase wire form applications already use
//! (`intraOpNumThreads`, `executionProviders`, ...). Unrecognized keys are
//! ignored. Enumerated settings accept either their name or the numeric
//! level engines traditionally use (`graphOptimizationLevel: 3`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InferenceError;
use crate::Result;

/// Options applied when a model is loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
    pub intra_op_num_threads: Option<usize>,
    pub inter_op_num_threads: Option<usize>,
    pub graph_optimization_level: Option<GraphOptimizationLevel>,
    pub execution_mode: Option<ExecutionMode>,
    pub enable_memory_pattern: Option<bool>,
    /// Providers in order of preference. Empty means engine default (CPU).
    pub execution_providers: Vec<ProviderSpec>,
    pub log_severity_level: Option<LogSeverityLevel>,
    /// Locations of external weight files, in any model-source form.
    pub external_data_paths: Vec<String>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intra_op_threads(mut self, threads: usize) -> Self {
        self.intra_op_num_threads = Some(threads);
        self
    }

    pub fn with_inter_op_threads(mut self, threads: usize) -> Self {
        self.inter_op_num_threads = Some(threads);
        self
    }

    pub fn with_graph_optimization_level(mut self, level: GraphOptimizationLevel) -> Self {
        self.graph_optimization_level = Some(level);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn with_provider(mut self, provider: ProviderSpec) -> Self {
        self.execution_providers.push(provider);
        self
    }

    /// Parse options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| InferenceError::Options(e.to_string()))
    }

    /// Fill every unset field of `self` from `defaults`.
    pub fn merged_over(&self, defaults: &SessionOptions) -> SessionOptions {
        SessionOptions {
            intra_op_num_threads: self.intra_op_num_threads.or(defaults.intra_op_num_threads),
            inter_op_num_threads: self.inter_op_num_threads.or(defaults.inter_op_num_threads),
            graph_optimization_level: self
                .graph_optimization_level
                .or(defaults.graph_optimization_level),
            execution_mode: self.execution_mode.or(defaults.execution_mode),
            enable_memory_pattern: self.enable_memory_pattern.or(defaults.enable_memory_pattern),
            execution_providers: if self.execution_providers.is_empty() {
                defaults.execution_providers.clone()
            } else {
                self.execution_providers.clone()
            },
            log_severity_level: self.log_severity_level.or(defaults.log_severity_level),
            external_data_paths: if self.external_data_paths.is_empty() {
                defaults.external_data_paths.clone()
            } else {
                self.external_data_paths.clone()
            },
        }
    }

    /// Reject provider names no adapter recognizes.
    ///
    /// Unknown providers fail here instead of silently degrading to CPU.
    pub fn validate(&self) -> Result<()> {
        for provider in &self.execution_providers {
            if let ProviderSpec::Unknown(name) = provider {
                return Err(InferenceError::Options(format!(
                    "unrecognized execution provider '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Wire representation shared by the enumerated settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Level {
    Name(String),
    Index(u64),
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $idx:literal : $wire:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "Level", into = "Level")]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const fn index(self) -> u64 {
                match self {
                    $(Self::$variant => $idx),*
                }
            }

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),*
                }
            }
        }

        impl TryFrom<Level> for $name {
            type Error = String;

            fn try_from(level: Level) -> std::result::Result<Self, String> {
                match level {
                    Level::Name(name) => match name.to_ascii_lowercase().as_str() {
                        $($wire => Ok(Self::$variant),)*
                        other => Err(format!(
                            "unknown {} '{}'",
                            stringify!($name),
                            other
                        )),
                    },
                    Level::Index(index) => match index {
                        $($idx => Ok(Self::$variant),)*
                        other => Err(format!(
                            "{} out of range: {}",
                            stringify!($name),
                            other
                        )),
                    },
                }
            }
        }

        impl From<$name> for Level {
            fn from(value: $name) -> Level {
                Level::Name(value.as_str().to_string())
            }
        }
    };
}

wire_enum! {
    /// How aggressively the engine rewrites the graph.
    GraphOptimizationLevel {
        Disable = 0: "disable",
        Basic = 1: "basic",
        Extended = 2: "extended",
        All = 3: "all",
    }
}

wire_enum! {
    /// Whether independent graph branches may run concurrently.
    ExecutionMode {
        Sequential = 0: "sequential",
        Parallel = 1: "parallel",
    }
}

wire_enum! {
    /// Minimum severity of engine log messages.
    LogSeverityLevel {
        Verbose = 0: "verbose",
        Info = 1: "info",
        Warning = 2: "warning",
        Error = 3: "error",
        Fatal = 4: "fatal",
    }
}

/// NNAPI provider flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NnapiOptions {
    #[serde(rename = "useFP16")]
    pub use_fp16: bool,
    #[serde(rename = "useNCHW")]
    pub use_nchw: bool,
    pub cpu_disabled: bool,
    pub cpu_only: bool,
}

/// CoreML provider flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreMlOptions {
    #[serde(rename = "useCPUOnly")]
    pub use_cpu_only: bool,
    #[serde(rename = "useCPUAndGPU")]
    pub use_cpu_and_gpu: bool,
    pub enable_on_subgraph: bool,
    #[serde(rename = "onlyEnableDeviceWithANE")]
    pub only_enable_device_with_ane: bool,
}

/// XNNPACK provider settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct XnnpackOptions {
    pub intra_op_num_threads: Option<usize>,
}

/// One entry of `executionProviders`.
///
/// On the wire this is either a bare name (`"nnapi"`) or an object carrying
/// the name plus provider flags (`{"name": "nnapi", "useFP16": true}`).
/// Flags a provider does not know are ignored. Names no provider claims are
/// kept as [`ProviderSpec::Unknown`] so that loading can fail with a precise
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProvider", into = "RawProvider")]
pub enum ProviderSpec {
    Cpu,
    Xnnpack(XnnpackOptions),
    Nnapi(NnapiOptions),
    CoreMl(CoreMlOptions),
    Unknown(String),
}

impl ProviderSpec {
    /// The provider's canonical wire name.
    pub fn name(&self) -> &str {
        match self {
            Self::Cpu => "cpu",
            Self::Xnnpack(_) => "xnnpack",
            Self::Nnapi(_) => "nnapi",
            Self::CoreMl(_) => "coreml",
            Self::Unknown(name) => name,
        }
    }

    /// Build a provider from its name with default flags.
    pub fn named(name: &str) -> Self {
        match Self::try_from(RawProvider::Name(name.to_string())) {
            Ok(spec) => spec,
            Err(_) => Self::Unknown(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawProvider {
    Name(String),
    Object {
        name: String,
        #[serde(flatten)]
        flags: Map<String, Value>,
    },
}

fn flags_from<T: for<'de> Deserialize<'de>>(flags: Map<String, Value>) -> std::result::Result<T, String> {
    serde_json::from_value(Value::Object(flags)).map_err(|e| e.to_string())
}

impl TryFrom<RawProvider> for ProviderSpec {
    type Error = String;

    fn try_from(raw: RawProvider) -> std::result::Result<Self, String> {
        let (name, flags) = match raw {
            RawProvider::Name(name) => (name, Map::new()),
            RawProvider::Object { name, flags } => (name, flags),
        };
        let spec = match name.to_ascii_lowercase().as_str() {
            "cpu" => ProviderSpec::Cpu,
            "xnnpack" => ProviderSpec::Xnnpack(flags_from(flags)?),
            "nnapi" => ProviderSpec::Nnapi(flags_from(flags)?),
            "coreml" => ProviderSpec::CoreMl(flags_from(flags)?),
            _ => ProviderSpec::Unknown(name),
        };
        Ok(spec)
    }
}

impl From<ProviderSpec> for RawProvider {
    fn from(spec: ProviderSpec) -> RawProvider {
        let flags = match &spec {
            ProviderSpec::Xnnpack(o) => serde_json::to_value(o).ok(),
            ProviderSpec::Nnapi(o) => serde_json::to_value(o).ok(),
            ProviderSpec::CoreMl(o) => serde_json::to_value(o).ok(),
            ProviderSpec::Cpu | ProviderSpec::Unknown(_) => None,
        };
        match flags {
            Some(Value::Object(flags)) => RawProvider::Object {
                name: spec.name().to_string(),
                flags,
            },
            _ => RawProvider::Name(spec.name().to_string()),
        }
    }
}
