//! ONNX Runtime (ort) engine for native platforms.

use std::collections::HashMap;

use ort::ep::{self, ExecutionProviderDispatch};
use ort::logging::LogLevel;
use ort::session::builder::{GraphOptimizationLevel as OrtOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use tracing::{debug, warn};

use crate::backend::{EngineSession, InferenceEngine, LoadRequest};
use crate::error::InferenceError;
use crate::options::{ExecutionMode, GraphOptimizationLevel, LogSeverityLevel, SessionOptions};
use crate::tensor::{self, DataType, Element, EncodedTensor, TensorDescriptor};
use crate::{NativeBuffer, ProviderSpec, Result};

const ORT_VERSION: &str = "2.0.0-rc.11";

/// Engine backed by ONNX Runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtEngine;

impl OrtEngine {
    pub fn new() -> Self {
        Self
    }
}

fn session_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Options(e.to_string())
}

fn classify_load_error(e: impl std::fmt::Display) -> InferenceError {
    let message = e.to_string();
    if message.contains("NOT_IMPLEMENTED") || message.contains("Could not find an implementation") {
        InferenceError::UnsupportedOp(message)
    } else {
        InferenceError::ModelParse(message)
    }
}

fn execution_providers(options: &SessionOptions) -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::with_capacity(options.execution_providers.len());
    for spec in &options.execution_providers {
        match spec {
            ProviderSpec::Cpu => providers.push(ep::CPU::default().build()),
            ProviderSpec::Xnnpack(flags) => {
                let mut xnnpack = ep::XNNPACK::default();
                if let Some(threads) = flags.intra_op_num_threads.and_then(std::num::NonZeroUsize::new) {
                    xnnpack = xnnpack.with_intra_op_num_threads(threads);
                }
                providers.push(xnnpack.build().error_on_failure());
            }
            #[cfg(target_os = "android")]
            ProviderSpec::Nnapi(flags) => providers.push(
                ep::NNAPI::default()
                    .with_fp16(flags.use_fp16)
                    .with_nchw(flags.use_nchw)
                    .with_disable_cpu(flags.cpu_disabled)
                    .with_cpu_only(flags.cpu_only)
                    .build()
                    .error_on_failure(),
            ),
            #[cfg(target_vendor = "apple")]
            ProviderSpec::CoreMl(flags) => {
                use ep::coreml::ComputeUnits;

                let mut coreml = ep::CoreML::default().with_subgraphs(flags.enable_on_subgraph);
                if flags.use_cpu_only {
                    coreml = coreml.with_compute_units(ComputeUnits::CPUOnly);
                } else if flags.use_cpu_and_gpu {
                    coreml = coreml.with_compute_units(ComputeUnits::CPUAndGPU);
                } else if flags.only_enable_device_with_ane {
                    coreml = coreml.with_compute_units(ComputeUnits::CPUAndNeuralEngine);
                }
                providers.push(coreml.build().error_on_failure());
            }
            // validated before load; listed for exhaustiveness
            ProviderSpec::Unknown(name) => warn!("Ignoring unrecognized provider '{}'", name),
            #[allow(unreachable_patterns)]
            other => warn!(
                "Execution provider '{}' is not available on this platform, using CPU",
                other.name()
            ),
        }
    }
    providers
}

fn configure(options: &SessionOptions) -> Result<SessionBuilder> {
    let mut builder = Session::builder().map_err(session_error)?;

    let providers = execution_providers(options);
    if !providers.is_empty() {
        builder = builder
            .with_execution_providers(providers)
            .map_err(session_error)?;
    }

    if let Some(level) = options.graph_optimization_level {
        let level = match level {
            GraphOptimizationLevel::Disable => OrtOptimizationLevel::Disable,
            GraphOptimizationLevel::Basic => OrtOptimizationLevel::Level1,
            GraphOptimizationLevel::Extended => OrtOptimizationLevel::Level2,
            GraphOptimizationLevel::All => OrtOptimizationLevel::Level3,
        };
        builder = builder.with_optimization_level(level).map_err(session_error)?;
    }
    if let Some(enabled) = options.enable_memory_pattern {
        builder = builder.with_memory_pattern(enabled).map_err(session_error)?;
    }
    if let Some(threads) = options.intra_op_num_threads {
        builder = builder.with_intra_threads(threads).map_err(session_error)?;
    }
    if let Some(threads) = options.inter_op_num_threads {
        builder = builder.with_inter_threads(threads).map_err(session_error)?;
    }
    if let Some(mode) = options.execution_mode {
        builder = builder
            .with_parallel_execution(mode == ExecutionMode::Parallel)
            .map_err(session_error)?;
    }
    if let Some(severity) = options.log_severity_level {
        let level = match severity {
            LogSeverityLevel::Verbose => LogLevel::Verbose,
            LogSeverityLevel::Info => LogLevel::Info,
            LogSeverityLevel::Warning => LogLevel::Warning,
            LogSeverityLevel::Error => LogLevel::Error,
            LogSeverityLevel::Fatal => LogLevel::Fatal,
        };
        builder = builder.with_log_level(level).map_err(session_error)?;
    }

    Ok(builder)
}

impl InferenceEngine for OrtEngine {
    fn version(&self) -> String {
        format!("ort {}", ORT_VERSION)
    }

    fn supports_provider(&self, provider: &ProviderSpec) -> bool {
        !matches!(provider, ProviderSpec::Unknown(_))
    }

    fn load(&self, request: LoadRequest) -> Result<Box<dyn EngineSession>> {
        if request.model.is_empty() {
            return Err(InferenceError::ModelParse("model buffer is empty".to_string()));
        }
        debug!("Loading ONNX model from {} bytes", request.model.len());

        let mut builder = configure(&request.options)?;
        for external in request.external_data {
            debug!("Attaching external data '{}' ({} bytes)", external.path, external.data.len());
            builder = builder
                .with_external_initializer_file_in_memory(external.path, external.data.to_vec().into())
                .map_err(session_error)?;
        }

        let session = builder
            .commit_from_memory(request.model.as_slice())
            .map_err(classify_load_error)?;

        let inputs = session
            .inputs()
            .iter()
            .map(|i| describe(i.name(), i.dtype()))
            .collect::<Result<Vec<_>>>()?;

        let outputs = session
            .outputs()
            .iter()
            .map(|o| describe(o.name(), o.dtype()))
            .collect::<Result<Vec<_>>>()?;

        debug!("Model inputs: {:?}", inputs);
        debug!("Model outputs: {:?}", outputs);

        Ok(Box::new(OrtSession {
            session,
            inputs,
            outputs,
        }))
    }
}

fn describe(name: &str, value_type: &ValueType) -> Result<TensorDescriptor> {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => {
            let dtype = data_type(*ty).ok_or_else(|| {
                InferenceError::ModelParse(format!("'{}' uses unsupported element type {:?}", name, ty))
            })?;
            Ok(TensorDescriptor::new(name, dtype, shape.iter().copied().collect()))
        }
        other => Err(InferenceError::ModelParse(format!(
            "'{}' is not a tensor: {:?}",
            name, other
        ))),
    }
}

fn data_type(ty: TensorElementType) -> Option<DataType> {
    match ty {
        TensorElementType::Float32 => Some(DataType::Float32),
        TensorElementType::Float64 => Some(DataType::Float64),
        TensorElementType::Int8 => Some(DataType::Int8),
        TensorElementType::Uint8 => Some(DataType::Uint8),
        TensorElementType::Int16 => Some(DataType::Int16),
        TensorElementType::Int32 => Some(DataType::Int32),
        TensorElementType::Int64 => Some(DataType::Int64),
        TensorElementType::Bool => Some(DataType::Bool),
        _ => None,
    }
}

/// A model loaded into ONNX Runtime.
pub struct OrtSession {
    session: Session,
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
}

fn to_input<T>(tensor: &EncodedTensor) -> Result<SessionInputValue<'static>>
where
    T: Element + ort::tensor::PrimitiveTensorElementType + std::fmt::Debug,
{
    let shape = tensor.dims.clone();
    let data = tensor.values::<T>()?;
    Tensor::from_array((shape, data))
        .map(Into::into)
        .map_err(|e| InferenceError::ShapeMismatch {
            name: tensor.name.clone(),
            reason: e.to_string(),
        })
}

fn convert_input(tensor: &EncodedTensor) -> Result<SessionInputValue<'static>> {
    match tensor.data_type()? {
        DataType::Float32 => to_input::<f32>(tensor),
        DataType::Float64 => to_input::<f64>(tensor),
        DataType::Int8 => to_input::<i8>(tensor),
        DataType::Uint8 => to_input::<u8>(tensor),
        DataType::Int16 => to_input::<i16>(tensor),
        DataType::Int32 => to_input::<i32>(tensor),
        DataType::Int64 => to_input::<i64>(tensor),
        DataType::Bool => to_input::<bool>(tensor),
    }
}

fn extract<T>(name: &str, value: &ort::value::DynValue) -> Result<NativeBuffer>
where
    T: Element + ort::tensor::PrimitiveTensorElementType,
{
    let (_, data) = value
        .try_extract_tensor::<T>()
        .map_err(|e| InferenceError::OutputExtraction(format!("'{}': {}", name, e)))?;
    Ok(tensor::encode(data.iter().copied()))
}

impl EngineSession for OrtSession {
    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    fn run(&mut self, feeds: &[EncodedTensor]) -> Result<Vec<(String, NativeBuffer)>> {
        let ort_inputs: Vec<(&str, SessionInputValue<'static>)> = feeds
            .iter()
            .map(|feed| Ok((feed.name.as_str(), convert_input(feed)?)))
            .collect::<Result<Vec<_>>>()?;

        let outputs = self
            .session
            .run(ort_inputs)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let produced: HashMap<&str, _> = outputs.iter().collect();

        self.outputs
            .iter()
            .map(|declared| {
                let value = produced.get(declared.name.as_str()).ok_or_else(|| {
                    InferenceError::OutputExtraction(format!("engine did not produce '{}'", declared.name))
                })?;
                let name = declared.name.as_str();
                let buffer = match declared.dtype {
                    DataType::Float32 => extract::<f32>(name, value),
                    DataType::Float64 => extract::<f64>(name, value),
                    DataType::Int8 => extract::<i8>(name, value),
                    DataType::Uint8 => extract::<u8>(name, value),
                    DataType::Int16 => extract::<i16>(name, value),
                    DataType::Int32 => extract::<i32>(name, value),
                    DataType::Int64 => extract::<i64>(name, value),
                    DataType::Bool => extract::<bool>(name, value),
                }?;
                Ok((declared.name.clone(), buffer))
            })
            .collect()
    }
}
