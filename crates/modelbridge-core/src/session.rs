//! Loaded model sessions.
//!
//! A [`Session`] wraps an engine session behind an async mutex. At most one
//! `run` is in flight at a time; a second concurrent `run` fails fast with
//! [`BridgeError::SessionBusy`] instead of queueing. Feeds are checked
//! against the declared inputs before the engine sees them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use modelbridge_inference::{EncodedTensor, EngineSession, InferenceError, NativeBuffer, TensorDescriptor};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

type Handle = Arc<Mutex<Option<Box<dyn EngineSession>>>>;

/// Output buffers of one run, in the model's declared output order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOutputs {
    entries: Vec<(String, NativeBuffer)>,
}

impl SessionOutputs {
    pub fn get(&self, name: &str) -> Option<&NativeBuffer> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, buffer)| buffer)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeBuffer)> {
        self.entries.iter().map(|(name, buffer)| (name.as_str(), buffer))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_map(self) -> HashMap<String, NativeBuffer> {
        self.entries.into_iter().collect()
    }
}

impl IntoIterator for SessionOutputs {
    type Item = (String, NativeBuffer);
    type IntoIter = std::vec::IntoIter<(String, NativeBuffer)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A loaded model. Input and output descriptors are fixed at load time.
pub struct Session {
    handle: Handle,
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(engine_session: Box<dyn EngineSession>) -> Self {
        let inputs = engine_session.inputs().to_vec();
        let outputs = engine_session.outputs().to_vec();
        Self {
            handle: Arc::new(Mutex::new(Some(engine_session))),
            inputs,
            outputs,
            closed: AtomicBool::new(false),
        }
    }

    pub fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Order feeds by declared input and check each against its descriptor.
    ///
    /// Map keys name the input; a tensor's own `name` field is overwritten.
    fn prepare_feeds(&self, mut feeds: HashMap<String, EncodedTensor>) -> Result<Vec<EncodedTensor>> {
        let mut unknown: Vec<&String> = feeds
            .keys()
            .filter(|name| !self.inputs.iter().any(|d| &d.name == *name))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(InferenceError::UnknownInput {
                name: name.to_string(),
            }
            .into());
        }

        let mut ordered = Vec::with_capacity(self.inputs.len());
        for descriptor in &self.inputs {
            let mut tensor = feeds
                .remove(&descriptor.name)
                .ok_or_else(|| InferenceError::MissingInput {
                    name: descriptor.name.clone(),
                })?;
            tensor.name = descriptor.name.clone();
            descriptor.check(&tensor)?;
            ordered.push(tensor);
        }
        Ok(ordered)
    }

    /// Run inference.
    ///
    /// Returns one freshly allocated buffer per declared output, in
    /// declaration order, or an error and no outputs at all.
    pub async fn run(&self, feeds: HashMap<String, EncodedTensor>) -> Result<SessionOutputs> {
        let mut guard = self
            .handle
            .clone()
            .try_lock_owned()
            .map_err(|_| BridgeError::SessionBusy)?;
        if guard.is_none() {
            return Err(BridgeError::SessionClosed);
        }

        let ordered = self.prepare_feeds(feeds)?;
        debug!(
            "Running session with inputs {:?}",
            ordered.iter().map(|t| &t.name).collect::<Vec<_>>()
        );

        let produced = tokio::task::spawn_blocking(move || match guard.as_mut() {
            Some(session) => session.run(&ordered).map_err(BridgeError::from),
            None => Err(BridgeError::SessionClosed),
        })
        .await
        .map_err(|e| InferenceError::InferenceFailed(e.to_string()))??;

        self.collect_outputs(produced)
    }

    fn collect_outputs(&self, mut produced: Vec<(String, NativeBuffer)>) -> Result<SessionOutputs> {
        let mut entries = Vec::with_capacity(self.outputs.len());
        for descriptor in &self.outputs {
            let position = produced
                .iter()
                .position(|(name, _)| name == &descriptor.name)
                .ok_or_else(|| {
                    InferenceError::OutputExtraction(format!(
                        "engine did not produce output '{}'",
                        descriptor.name
                    ))
                })?;
            entries.push(produced.swap_remove(position));
        }
        debug!("Run produced {} outputs", entries.len());
        Ok(SessionOutputs { entries })
    }

    /// Release the engine session. Waits for an in-flight run. Calling it
    /// again is a no-op.
    pub async fn close(&self) {
        let mut guard = self.handle.lock().await;
        match guard.take() {
            Some(session) => {
                drop(session);
                self.closed.store(true, Ordering::SeqCst);
                info!("Session closed");
            }
            None => debug!("Session already closed"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::test_support::MockEngine;
    use modelbridge_inference::{encode, DataType, InferenceEngine, LoadRequest, SessionOptions};
    use pretty_assertions::assert_eq;

    fn session_for(engine: &MockEngine) -> Session {
        let request = LoadRequest::new(NativeBuffer::from_vec(vec![1]), SessionOptions::default());
        Session::new(engine.load(request).unwrap())
    }

    fn square_engine() -> MockEngine {
        MockEngine::new(
            vec![TensorDescriptor::new("x", DataType::Float32, vec![2, 2])],
            vec![
                TensorDescriptor::new("y", DataType::Float32, vec![2, 2]),
                TensorDescriptor::new("z", DataType::Float32, vec![2, 2]),
            ],
        )
    }

    fn floats(name: &str, dims: Vec<i64>) -> EncodedTensor {
        let count: i64 = dims.iter().product();
        EncodedTensor::new(
            name,
            DataType::Float32,
            dims,
            encode((0..count).map(|v| v as f32)),
        )
    }

    fn feeds(tensors: Vec<EncodedTensor>) -> HashMap<String, EncodedTensor> {
        tensors.into_iter().map(|t| (t.name.clone(), t)).collect()
    }

    #[tokio::test]
    async fn test_matching_shape_runs() {
        let engine = square_engine();
        let session = session_for(&engine);

        let input = floats("x", vec![2, 2]);
        assert_eq!(input.data.len(), 16);

        let outputs = session.run(feeds(vec![input.clone()])).await.unwrap();
        assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["y", "z"]);
        assert_eq!(outputs.get("y"), Some(&input.data));
        assert_eq!(outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_mismatched_shape_rejected_before_engine() {
        let engine = square_engine();
        let session = session_for(&engine);

        let err = session.run(feeds(vec![floats("x", vec![3, 3])])).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Inference(InferenceError::ShapeMismatch { ref name, .. }) if name == "x"
        ));
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dynamic_axis_accepts_any_size() {
        let engine = MockEngine::new(
            vec![TensorDescriptor::new("tokens", DataType::Float32, vec![-1, 4])],
            vec![TensorDescriptor::new("out", DataType::Float32, vec![-1, 4])],
        );
        let session = session_for(&engine);

        for batch in [1, 7, 32] {
            let outputs = session
                .run(feeds(vec![floats("tokens", vec![batch, 4])]))
                .await
                .unwrap();
            assert_eq!(outputs.get("out").map(|b| b.len()), Some(batch as usize * 16));
        }
    }

    #[tokio::test]
    async fn test_missing_input_is_named() {
        let engine = MockEngine::new(
            vec![
                TensorDescriptor::new("input_ids", DataType::Int64, vec![1, -1]),
                TensorDescriptor::new("attention_mask", DataType::Int64, vec![1, -1]),
            ],
            vec![TensorDescriptor::new("logits", DataType::Float32, vec![1, 2])],
        );
        let session = session_for(&engine);

        let ids = EncodedTensor::new("input_ids", DataType::Int64, vec![1, 3], encode([1i64, 2, 3]));
        let err = session.run(feeds(vec![ids])).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Inference(InferenceError::MissingInput { ref name }) if name == "attention_mask"
        ));
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_input_rejected() {
        let engine = square_engine();
        let session = session_for(&engine);

        let err = session
            .run(feeds(vec![floats("x", vec![2, 2]), floats("extra", vec![1])]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Inference(InferenceError::UnknownInput { ref name }) if name == "extra"
        ));
    }

    #[tokio::test]
    async fn test_wrong_dtype_rejected() {
        let engine = square_engine();
        let session = session_for(&engine);

        let tensor = EncodedTensor::new("x", DataType::Int32, vec![2, 2], encode([0i32; 4]));
        let err = session.run(feeds(vec![tensor])).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Inference(InferenceError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_twice_then_run() {
        let engine = square_engine();
        let session = session_for(&engine);

        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        let err = session.run(feeds(vec![floats("x", vec![2, 2])])).await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionClosed));
        assert_eq!(session.input_names(), vec!["x"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_run_is_busy() {
        let gate = Arc::new(Barrier::new(2));
        let engine = square_engine().gated(gate.clone());
        let session = Arc::new(session_for(&engine));

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.run(feeds(vec![floats("x", vec![2, 2])])).await })
        };

        // Wait until the first run is inside the engine.
        let entered = gate.clone();
        tokio::task::spawn_blocking(move || entered.wait()).await.unwrap();

        let err = session.run(feeds(vec![floats("x", vec![2, 2])])).await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionBusy));

        let release = gate.clone();
        tokio::task::spawn_blocking(move || release.wait()).await.unwrap();

        assert!(first.await.unwrap().is_ok());
        assert_eq!(engine.runs.load(Ordering::SeqCst), 1);
    }
}
