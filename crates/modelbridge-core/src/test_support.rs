//! Test doubles for the transport and engine seams.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use modelbridge_inference::{
    EncodedTensor, EngineSession, InferenceEngine, InferenceError, LoadRequest, NativeBuffer,
    ProviderSpec, TensorDescriptor,
};
use reqwest::Url;

use crate::error::Result;
use crate::fetcher::{HttpResponse, HttpTransport};

enum Reply {
    Body(Vec<u8>),
    Declared(u64, Vec<u8>),
    Status(u16),
    Broken(Vec<u8>),
}

/// Transport that answers every GET the same way and counts requests.
pub(crate) struct MockTransport {
    reply: std::sync::Mutex<Reply>,
    calls: AtomicUsize,
}

impl MockTransport {
    fn with(reply: Reply) -> Self {
        Self {
            reply: std::sync::Mutex::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    /// 200 with the given body.
    pub fn ok(body: &[u8]) -> Self {
        Self::with(Reply::Body(body.to_vec()))
    }

    /// 200 whose Content-Length claims `length` but whose body is `body`.
    pub fn declaring(length: u64, body: &[u8]) -> Self {
        Self::with(Reply::Declared(length, body.to_vec()))
    }

    /// Empty response with the given status.
    pub fn status(status: u16) -> Self {
        Self::with(Reply::Status(status))
    }

    /// 200 whose body stream fails after the given bytes.
    pub fn broken(prefix: &[u8]) -> Self {
        Self::with(Reply::Broken(prefix.to_vec()))
    }

    /// Switch the body served from now on.
    pub fn serve(&self, body: &[u8]) {
        *self.reply.lock().unwrap() = Reply::Body(body.to_vec());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, _url: &Url) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.lock().unwrap();
        let response = match &*reply {
            Reply::Body(body) => HttpResponse {
                status: 200,
                content_length: Some(body.len() as u64),
                body: futures_util::stream::iter(vec![Ok(Bytes::from(body.clone()))]).boxed(),
            },
            Reply::Declared(length, body) => HttpResponse {
                status: 200,
                content_length: Some(*length),
                body: futures_util::stream::iter(vec![Ok(Bytes::from(body.clone()))]).boxed(),
            },
            Reply::Status(status) => HttpResponse {
                status: *status,
                content_length: Some(0),
                body: futures_util::stream::empty().boxed(),
            },
            Reply::Broken(prefix) => HttpResponse {
                status: 200,
                content_length: None,
                body: futures_util::stream::iter(vec![
                    Ok(Bytes::from(prefix.clone())),
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")),
                ])
                .boxed(),
            },
        };
        Ok(response)
    }
}

/// Engine that accepts any non-empty model and echoes a fixed signature.
pub(crate) struct MockEngine {
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    pub loads: Arc<AtomicUsize>,
    pub runs: Arc<AtomicUsize>,
    pub last_request: Arc<std::sync::Mutex<Option<LoadRequest>>>,
    gate: Option<Arc<Barrier>>,
}

impl MockEngine {
    pub fn new(inputs: Vec<TensorDescriptor>, outputs: Vec<TensorDescriptor>) -> Self {
        Self {
            inputs,
            outputs,
            loads: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(std::sync::Mutex::new(None)),
            gate: None,
        }
    }

    /// Make every run wait twice on the barrier: once on entry, once
    /// before returning.
    pub fn gated(mut self, gate: Arc<Barrier>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl InferenceEngine for MockEngine {
    fn version(&self) -> String {
        "mock 1.0".to_string()
    }

    fn supports_provider(&self, provider: &ProviderSpec) -> bool {
        matches!(provider, ProviderSpec::Cpu | ProviderSpec::Xnnpack(_))
    }

    fn load(&self, request: LoadRequest) -> modelbridge_inference::Result<Box<dyn EngineSession>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if request.model.is_empty() {
            return Err(InferenceError::ModelParse("empty model".to_string()));
        }
        *self.last_request.lock().unwrap() = Some(request);
        Ok(Box::new(MockSession {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            runs: self.runs.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct MockSession {
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    runs: Arc<AtomicUsize>,
    gate: Option<Arc<Barrier>>,
}

impl EngineSession for MockSession {
    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    /// Every output gets a copy of the first feed's bytes, emitted in
    /// reverse declaration order.
    fn run(&mut self, feeds: &[EncodedTensor]) -> modelbridge_inference::Result<Vec<(String, NativeBuffer)>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
            gate.wait();
        }
        let data = feeds.first().map(|f| f.data.clone()).unwrap_or_default();
        Ok(self
            .outputs
            .iter()
            .rev()
            .map(|o| (o.name.clone(), NativeBuffer::from_vec(data.to_vec())))
            .collect())
    }
}
