//! Tract engine for pure-Rust ONNX inference.

use std::collections::HashMap;
use std::io::Cursor;

use tract_onnx::prelude::*;
use tracing::{debug, warn};

use crate::backend::{EngineSession, InferenceEngine, LoadRequest};
use crate::error::InferenceError;
use crate::options::GraphOptimizationLevel;
use crate::tensor::{self, DataType, Element, EncodedTensor, TensorDescriptor};
use crate::{NativeBuffer, ProviderSpec, Result};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const TRACT_VERSION: &str = "0.21";

/// Plans are specialized per concrete input shape; keep only a few around.
const MAX_CACHED_PLANS: usize = 8;

/// Engine backed by tract. Runs on the CPU only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TractEngine;

impl TractEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for TractEngine {
    fn version(&self) -> String {
        format!("tract-onnx {}", TRACT_VERSION)
    }

    fn supports_provider(&self, provider: &ProviderSpec) -> bool {
        !matches!(provider, ProviderSpec::Unknown(_))
    }

    fn load(&self, request: LoadRequest) -> Result<Box<dyn EngineSession>> {
        let LoadRequest {
            model,
            options,
            external_data,
        } = request;

        if model.is_empty() {
            return Err(InferenceError::ModelParse("model buffer is empty".to_string()));
        }
        if !external_data.is_empty() {
            return Err(InferenceError::Options(
                "tract engine cannot load external data from memory".to_string(),
            ));
        }
        for provider in &options.execution_providers {
            if !matches!(provider, ProviderSpec::Cpu) {
                warn!("Execution provider '{}' is not available in tract, using CPU", provider.name());
            }
        }
        if options.intra_op_num_threads.is_some() || options.inter_op_num_threads.is_some() {
            debug!("Thread settings are managed by tract and were ignored");
        }

        debug!("Loading ONNX model with tract from {} bytes", model.len());

        let model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(model.as_slice()))
            .map_err(classify_load_error)?;

        // Typing the graph surfaces unimplemented operators and gives us the
        // declared shapes, with symbolic axes left dynamic.
        let typed = model.clone().into_typed().map_err(classify_load_error)?;

        let inputs = typed
            .input_outlets()
            .map_err(classify_load_error)?
            .iter()
            .map(|outlet| {
                let name = typed.node(outlet.node).name.clone();
                describe(&typed, *outlet, name)
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs = typed
            .output_outlets()
            .map_err(classify_load_error)?
            .iter()
            .map(|outlet| {
                let name = typed
                    .outlet_label(*outlet)
                    .map(str::to_string)
                    .unwrap_or_else(|| typed.node(outlet.node).name.clone());
                describe(&typed, *outlet, name)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Model inputs: {:?}", inputs);
        debug!("Model outputs: {:?}", outputs);

        let optimize = options.graph_optimization_level != Some(GraphOptimizationLevel::Disable);

        Ok(Box::new(TractSession {
            model,
            inputs,
            outputs,
            optimize,
            plans: HashMap::new(),
        }))
    }
}

fn describe(model: &TypedModel, outlet: OutletId, name: String) -> Result<TensorDescriptor> {
    let fact = model.outlet_fact(outlet).map_err(classify_load_error)?;
    let dtype = data_type(fact.datum_type).ok_or_else(|| {
        InferenceError::ModelParse(format!(
            "'{}' uses unsupported element type {:?}",
            name, fact.datum_type
        ))
    })?;
    let dims = fact.shape.iter().map(|d| d.to_i64().unwrap_or(-1)).collect();
    Ok(TensorDescriptor::new(name, dtype, dims))
}

fn classify_load_error(e: TractError) -> InferenceError {
    let message = format!("{:#}", e);
    if message.contains("Unimplemented") {
        InferenceError::UnsupportedOp(message)
    } else {
        InferenceError::ModelParse(message)
    }
}

fn data_type(dt: DatumType) -> Option<DataType> {
    match dt {
        DatumType::F32 => Some(DataType::Float32),
        DatumType::F64 => Some(DataType::Float64),
        DatumType::I8 => Some(DataType::Int8),
        DatumType::U8 => Some(DataType::Uint8),
        DatumType::I16 => Some(DataType::Int16),
        DatumType::I32 => Some(DataType::Int32),
        DatumType::I64 => Some(DataType::Int64),
        DatumType::Bool => Some(DataType::Bool),
        _ => None,
    }
}

fn datum_type(dt: DataType) -> DatumType {
    match dt {
        DataType::Float32 => DatumType::F32,
        DataType::Float64 => DatumType::F64,
        DataType::Int8 => DatumType::I8,
        DataType::Uint8 => DatumType::U8,
        DataType::Int16 => DatumType::I16,
        DataType::Int32 => DatumType::I32,
        DataType::Int64 => DatumType::I64,
        DataType::Bool => DatumType::Bool,
    }
}

/// A model loaded into tract.
pub struct TractSession {
    model: InferenceModel,
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    optimize: bool,
    plans: HashMap<Vec<Vec<usize>>, Plan>,
}

impl TractSession {
    fn build_plan(&self, shapes: &[Vec<usize>]) -> Result<Plan> {
        let mut model = self.model.clone();
        for (idx, (shape, input)) in shapes.iter().zip(&self.inputs).enumerate() {
            model
                .set_input_fact(idx, InferenceFact::dt_shape(datum_type(input.dtype), shape.as_slice()))
                .map_err(|e| InferenceError::InferenceFailed(format!("Failed to set input shape: {}", e)))?;
        }

        let typed = model
            .into_typed()
            .map_err(|e| InferenceError::InferenceFailed(format!("Failed to type model: {}", e)))?;
        let typed = if self.optimize {
            typed
                .into_optimized()
                .map_err(|e| InferenceError::InferenceFailed(format!("Failed to optimize: {}", e)))?
        } else {
            typed
        };
        typed
            .into_runnable()
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))
    }

    fn convert_input(tensor: &EncodedTensor) -> Result<TValue> {
        match tensor.data_type()? {
            DataType::Float32 => to_tvalue::<f32>(tensor),
            DataType::Float64 => to_tvalue::<f64>(tensor),
            DataType::Int8 => to_tvalue::<i8>(tensor),
            DataType::Uint8 => to_tvalue::<u8>(tensor),
            DataType::Int16 => to_tvalue::<i16>(tensor),
            DataType::Int32 => to_tvalue::<i32>(tensor),
            DataType::Int64 => to_tvalue::<i64>(tensor),
            DataType::Bool => to_tvalue::<bool>(tensor),
        }
    }

    fn convert_output(name: &str, value: &TValue) -> Result<NativeBuffer> {
        let dtype = data_type(value.datum_type()).ok_or_else(|| {
            InferenceError::OutputExtraction(format!("unsupported output type for '{}'", name))
        })?;
        match dtype {
            DataType::Float32 => from_tvalue::<f32>(name, value),
            DataType::Float64 => from_tvalue::<f64>(name, value),
            DataType::Int8 => from_tvalue::<i8>(name, value),
            DataType::Uint8 => from_tvalue::<u8>(name, value),
            DataType::Int16 => from_tvalue::<i16>(name, value),
            DataType::Int32 => from_tvalue::<i32>(name, value),
            DataType::Int64 => from_tvalue::<i64>(name, value),
            DataType::Bool => from_tvalue::<bool>(name, value),
        }
    }
}

fn to_tvalue<T: Element + Datum>(tensor: &EncodedTensor) -> Result<TValue> {
    let shape = tensor.shape()?;
    let values = tensor.values::<T>()?;
    let array = tract_ndarray::ArrayD::from_shape_vec(tract_ndarray::IxDyn(&shape), values)
        .map_err(|e| InferenceError::ShapeMismatch {
            name: tensor.name.clone(),
            reason: e.to_string(),
        })?;
    Ok(array.into_tvalue())
}

fn from_tvalue<T: Element + Datum>(name: &str, value: &TValue) -> Result<NativeBuffer> {
    let values = value
        .as_slice::<T>()
        .map_err(|e| InferenceError::OutputExtraction(format!("'{}': {}", name, e)))?;
    Ok(tensor::encode(values.iter().copied()))
}

impl EngineSession for TractSession {
    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    fn run(&mut self, feeds: &[EncodedTensor]) -> Result<Vec<(String, NativeBuffer)>> {
        // tract takes inputs positionally, in declaration order.
        let ordered = self
            .inputs
            .iter()
            .map(|input| {
                feeds
                    .iter()
                    .find(|feed| feed.name == input.name)
                    .ok_or_else(|| InferenceError::MissingInput {
                        name: input.name.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let shapes = ordered
            .iter()
            .map(|feed| feed.shape())
            .collect::<Result<Vec<_>>>()?;

        if !self.plans.contains_key(&shapes) {
            let plan = self.build_plan(&shapes)?;
            if self.plans.len() >= MAX_CACHED_PLANS {
                self.plans.clear();
            }
            self.plans.insert(shapes.clone(), plan);
        }
        let plan = self
            .plans
            .get(&shapes)
            .ok_or_else(|| InferenceError::InferenceFailed("execution plan missing".to_string()))?;

        let tract_inputs: TVec<TValue> = ordered
            .into_iter()
            .map(Self::convert_input)
            .collect::<Result<TVec<_>>>()?;

        let outputs = plan
            .run(tract_inputs)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        if outputs.len() != self.outputs.len() {
            return Err(InferenceError::OutputExtraction(format!(
                "model declares {} outputs, engine produced {}",
                self.outputs.len(),
                outputs.len()
            )));
        }

        self.outputs
            .iter()
            .zip(outputs.iter())
            .map(|(declared, value)| {
                Ok((declared.name.clone(), Self::convert_output(&declared.name, value)?))
            })
            .collect()
    }
}
