//! Common test utilities: an in-memory inference server.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tonic::Status;
use tritonstream_core::proto::inference as pb;
use tritonstream_core::request::{SHARED_MEMORY_BYTE_SIZE, SHARED_MEMORY_OFFSET, SHARED_MEMORY_REGION};
use tritonstream_core::tensor::codec::{decode_raw, encode_raw, from_contents};
use tritonstream_core::{
    ClientConfig, Datatype, Error, InferenceClient, InferenceTransport, Parameter, Result,
    SharedMemoryRegion, TensorData,
};

/// Model every mock starts with.
pub const SIMPLE_MODEL: &str = "simple";

#[derive(Default)]
struct MockState {
    loaded: BTreeSet<String>,
    known: BTreeSet<String>,
    regions: BTreeMap<String, pb::system_shared_memory_status_response::RegionStatus>,
    cuda_regions: BTreeMap<String, pb::cuda_shared_memory_status_response::RegionStatus>,
    trace: HashMap<String, Vec<String>>,
    inference_counts: HashMap<String, u64>,
    events: Vec<String>,
}

/// In-memory transport that behaves like a small inference server.
///
/// Inference echoes every input back as an output of the same name (or of
/// the requested output name at the same position). Shared-memory inputs and
/// outputs are read from and written to the registered regions.
pub struct MockTransport {
    state: Mutex<MockState>,
    live: AtomicBool,
    ready: AtomicBool,
    unavailable: AtomicBool,
    fail_infer: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    infer_calls: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        let mut state = MockState::default();
        state.known.insert(SIMPLE_MODEL.to_string());
        state.known.insert("densenet".to_string());
        state.loaded.insert(SIMPLE_MODEL.to_string());
        state
            .trace
            .insert("trace_level".to_string(), vec!["OFF".to_string()]);
        Self {
            state: Mutex::new(state),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
            fail_infer: AtomicBool::new(false),
            gate: None,
            infer_calls: AtomicUsize::new(0),
        }
    }
}

fn status(e: Error) -> Status {
    Status::invalid_argument(e.to_string())
}

fn shm_ref(params: &HashMap<String, pb::InferParameter>) -> Option<(String, u64, u64)> {
    let region = Parameter::from_proto(params.get(SHARED_MEMORY_REGION)?)?;
    let byte_size = params
        .get(SHARED_MEMORY_BYTE_SIZE)
        .and_then(Parameter::from_proto)
        .and_then(|p| p.as_u64())?;
    let offset = params
        .get(SHARED_MEMORY_OFFSET)
        .and_then(Parameter::from_proto)
        .and_then(|p| p.as_u64())
        .unwrap_or(0);
    Some((region.as_str()?.to_string(), byte_size, offset))
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose inference calls wait for a permit from `gate`.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Every RPC fails with `UNAVAILABLE`, as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Inference fails with `INTERNAL`.
    pub fn set_fail_infer(&self, fail: bool) {
        self.fail_infer.store(fail, Ordering::SeqCst);
    }

    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self, model: &str) -> bool {
        self.state.lock().loaded.contains(model)
    }

    pub fn registered_regions(&self) -> Vec<String> {
        self.state.lock().regions.keys().cloned().collect()
    }

    /// Control-plane calls in the order they were received.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    fn check_available(&self) -> std::result::Result<(), Status> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Status::unavailable("connection refused"));
        }
        Ok(())
    }

    fn region(&self, name: &str) -> std::result::Result<pb::system_shared_memory_status_response::RegionStatus, Status> {
        self.state
            .lock()
            .regions
            .get(name)
            .cloned()
            .ok_or_else(|| Status::invalid_argument(format!("unregistered region '{}'", name)))
    }

    fn attach(&self, name: &str) -> std::result::Result<(SharedMemoryRegion, u64), Status> {
        let entry = self.region(name)?;
        let region = SharedMemoryRegion::attach_as(name, entry.key).map_err(status_from)?;
        Ok((region, entry.offset))
    }

    fn input_data(
        &self,
        tensor: &pb::model_infer_request::InferInputTensor,
        raw: Option<&Vec<u8>>,
    ) -> std::result::Result<TensorData, Status> {
        let datatype: Datatype = tensor.datatype.parse().map_err(status)?;
        if let Some((name, byte_size, offset)) = shm_ref(&tensor.parameters) {
            let (region, base) = self.attach(&name)?;
            let bytes = region.read_bytes(base + offset, byte_size).map_err(status)?;
            return decode_raw(datatype, &bytes, &tensor.shape).map_err(status);
        }
        match (&tensor.contents, raw) {
            (Some(contents), _) => from_contents(datatype, contents, &tensor.shape).map_err(status),
            (None, Some(bytes)) => decode_raw(datatype, bytes, &tensor.shape).map_err(status),
            (None, None) => Err(Status::invalid_argument(format!(
                "input '{}' has no data",
                tensor.name
            ))),
        }
    }
}

fn status_from(e: Error) -> Status {
    match e {
        Error::RegionNotFound(key) => Status::not_found(key),
        other => status(other),
    }
}

#[async_trait]
impl InferenceTransport for MockTransport {
    async fn server_live(&self, _: pb::ServerLiveRequest) -> Result<pb::ServerLiveResponse> {
        self.check_available()?;
        Ok(pb::ServerLiveResponse {
            live: self.live.load(Ordering::SeqCst),
        })
    }

    async fn server_ready(&self, _: pb::ServerReadyRequest) -> Result<pb::ServerReadyResponse> {
        self.check_available()?;
        Ok(pb::ServerReadyResponse {
            ready: self.ready.load(Ordering::SeqCst),
        })
    }

    async fn server_metadata(
        &self,
        _: pb::ServerMetadataRequest,
    ) -> Result<pb::ServerMetadataResponse> {
        self.check_available()?;
        Ok(pb::ServerMetadataResponse {
            name: "mock".into(),
            version: "2.41.0".into(),
            extensions: vec![
                "classification".into(),
                "model_repository".into(),
                "system_shared_memory".into(),
            ],
        })
    }

    async fn model_ready(&self, request: pb::ModelReadyRequest) -> Result<pb::ModelReadyResponse> {
        self.check_available()?;
        Ok(pb::ModelReadyResponse {
            ready: self.is_loaded(&request.name),
        })
    }

    async fn model_metadata(
        &self,
        request: pb::ModelMetadataRequest,
    ) -> Result<pb::ModelMetadataResponse> {
        self.check_available()?;
        if !self.is_loaded(&request.name) {
            return Err(Status::not_found(format!("model '{}' is not loaded", request.name)).into());
        }
        let tensor = |name: &str| pb::model_metadata_response::TensorMetadata {
            name: name.into(),
            datatype: "INT32".into(),
            shape: vec![-1, 16],
        };
        Ok(pb::ModelMetadataResponse {
            name: request.name,
            versions: vec!["1".into()],
            platform: "onnxruntime_onnx".into(),
            inputs: vec![tensor("INPUT0"), tensor("INPUT1")],
            outputs: vec![tensor("OUTPUT0"), tensor("OUTPUT1")],
        })
    }

    async fn model_config(&self, request: pb::ModelConfigRequest) -> Result<pb::ModelConfigResponse> {
        self.check_available()?;
        if !self.is_loaded(&request.name) {
            return Ok(pb::ModelConfigResponse { config: None });
        }
        Ok(pb::ModelConfigResponse {
            config: Some(pb::ModelConfig {
                name: request.name,
                platform: "onnxruntime_onnx".into(),
                max_batch_size: 8,
                input: vec![pb::ModelInput {
                    name: "INPUT0".into(),
                    data_type: pb::DataType::TypeInt32 as i32,
                    format: 0,
                    dims: vec![16],
                }],
                output: vec![pb::ModelOutput {
                    name: "OUTPUT0".into(),
                    data_type: pb::DataType::TypeString as i32,
                    dims: vec![16],
                }],
                parameters: HashMap::new(),
                backend: "onnxruntime".into(),
            }),
        })
    }

    async fn model_statistics(
        &self,
        request: pb::ModelStatisticsRequest,
    ) -> Result<pb::ModelStatisticsResponse> {
        self.check_available()?;
        let state = self.state.lock();
        let model_stats = state
            .loaded
            .iter()
            .filter(|name| request.name.is_empty() || **name == request.name)
            .map(|name| {
                let count = state.inference_counts.get(name).copied().unwrap_or(0);
                pb::ModelStatistics {
                    name: name.clone(),
                    version: "1".into(),
                    last_inference: 0,
                    inference_count: count,
                    execution_count: count,
                    inference_stats: Some(pb::InferStatistics {
                        success: Some(pb::StatisticDuration { count, ns: count * 1000 }),
                        ..Default::default()
                    }),
                }
            })
            .collect();
        Ok(pb::ModelStatisticsResponse { model_stats })
    }

    async fn model_infer(&self, request: pb::ModelInferRequest) -> Result<pb::ModelInferResponse> {
        self.check_available()?;
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Status::cancelled("gate closed"))?;
        }
        if self.fail_infer.load(Ordering::SeqCst) {
            return Err(Status::internal("injected failure").into());
        }
        if !self.is_loaded(&request.model_name) {
            return Err(Status::not_found(format!(
                "model '{}' is not loaded",
                request.model_name
            ))
            .into());
        }

        let mut outputs = Vec::new();
        let mut raw_output_contents = Vec::new();
        for (i, input) in request.inputs.iter().enumerate() {
            let data = self.input_data(input, request.raw_input_contents.get(i))?;
            let datatype = data.datatype();
            let raw = encode_raw(datatype, &data).map_err(status)?;
            let requested = request.outputs.get(i);

            let mut tensor = pb::model_infer_response::InferOutputTensor {
                name: requested.map_or_else(|| input.name.clone(), |o| o.name.clone()),
                datatype: datatype.as_str().to_string(),
                shape: input.shape.clone(),
                parameters: HashMap::new(),
                contents: None,
            };

            match requested.and_then(|o| shm_ref(&o.parameters)) {
                Some((name, byte_size, offset)) => {
                    if (raw.len() as u64) > byte_size {
                        return Err(Status::invalid_argument("output region too small").into());
                    }
                    let (mut region, base) = self.attach(&name)?;
                    region.write(&raw, base + offset).map_err(status)?;
                    tensor.parameters = requested.map(|o| o.parameters.clone()).unwrap_or_default();
                    raw_output_contents.push(Vec::new());
                }
                None => raw_output_contents.push(raw),
            }
            outputs.push(tensor);
        }

        *self
            .state
            .lock()
            .inference_counts
            .entry(request.model_name.clone())
            .or_default() += 1;

        Ok(pb::ModelInferResponse {
            model_name: request.model_name,
            model_version: "1".into(),
            id: request.id,
            parameters: HashMap::new(),
            outputs,
            raw_output_contents,
        })
    }

    async fn repository_index(
        &self,
        request: pb::RepositoryIndexRequest,
    ) -> Result<pb::RepositoryIndexResponse> {
        self.check_available()?;
        let state = self.state.lock();
        let models = state
            .known
            .iter()
            .filter(|name| !request.ready || state.loaded.contains(*name))
            .map(|name| {
                let ready = state.loaded.contains(name);
                pb::repository_index_response::ModelIndex {
                    name: name.clone(),
                    version: "1".into(),
                    state: if ready { "READY" } else { "UNAVAILABLE" }.into(),
                    reason: if ready { "" } else { "unloaded" }.into(),
                }
            })
            .collect();
        Ok(pb::RepositoryIndexResponse { models })
    }

    async fn repository_model_load(
        &self,
        request: pb::RepositoryModelLoadRequest,
    ) -> Result<pb::RepositoryModelLoadResponse> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.known.contains(&request.model_name) {
            return Err(Status::not_found(format!(
                "model '{}' is not in the repository",
                request.model_name
            ))
            .into());
        }
        state.loaded.insert(request.model_name.clone());
        state.events.push(format!("load:{}", request.model_name));
        Ok(pb::RepositoryModelLoadResponse {})
    }

    async fn repository_model_unload(
        &self,
        request: pb::RepositoryModelUnloadRequest,
    ) -> Result<pb::RepositoryModelUnloadResponse> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.loaded.remove(&request.model_name);
        state.events.push(format!("unload:{}", request.model_name));
        Ok(pb::RepositoryModelUnloadResponse {})
    }

    async fn system_shared_memory_status(
        &self,
        request: pb::SystemSharedMemoryStatusRequest,
    ) -> Result<pb::SystemSharedMemoryStatusResponse> {
        self.check_available()?;
        let state = self.state.lock();
        if !request.name.is_empty() && !state.regions.contains_key(&request.name) {
            return Err(Status::not_found(format!("region '{}' not registered", request.name)).into());
        }
        let regions = state
            .regions
            .iter()
            .filter(|(name, _)| request.name.is_empty() || **name == request.name)
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect();
        Ok(pb::SystemSharedMemoryStatusResponse { regions })
    }

    async fn system_shared_memory_register(
        &self,
        request: pb::SystemSharedMemoryRegisterRequest,
    ) -> Result<pb::SystemSharedMemoryRegisterResponse> {
        self.check_available()?;
        // The server maps the region itself; a missing key fails registration.
        SharedMemoryRegion::attach_as(request.name.as_str(), request.key.as_str()).map_err(status_from)?;

        let mut state = self.state.lock();
        if state.regions.contains_key(&request.name) {
            return Err(Status::already_exists(format!(
                "region '{}' already registered",
                request.name
            ))
            .into());
        }
        state.events.push(format!("register:{}", request.name));
        state.regions.insert(
            request.name.clone(),
            pb::system_shared_memory_status_response::RegionStatus {
                name: request.name,
                key: request.key,
                offset: request.offset,
                byte_size: request.byte_size,
            },
        );
        Ok(pb::SystemSharedMemoryRegisterResponse {})
    }

    async fn system_shared_memory_unregister(
        &self,
        request: pb::SystemSharedMemoryUnregisterRequest,
    ) -> Result<pb::SystemSharedMemoryUnregisterResponse> {
        self.check_available()?;
        let mut state = self.state.lock();
        if request.name.is_empty() {
            state.regions.clear();
            state.events.push("unregister:*".to_string());
        } else {
            state.regions.remove(&request.name);
            state.events.push(format!("unregister:{}", request.name));
        }
        Ok(pb::SystemSharedMemoryUnregisterResponse {})
    }

    async fn cuda_shared_memory_status(
        &self,
        request: pb::CudaSharedMemoryStatusRequest,
    ) -> Result<pb::CudaSharedMemoryStatusResponse> {
        self.check_available()?;
        let regions = self
            .state
            .lock()
            .cuda_regions
            .iter()
            .filter(|(name, _)| request.name.is_empty() || **name == request.name)
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect();
        Ok(pb::CudaSharedMemoryStatusResponse { regions })
    }

    async fn cuda_shared_memory_register(
        &self,
        request: pb::CudaSharedMemoryRegisterRequest,
    ) -> Result<pb::CudaSharedMemoryRegisterResponse> {
        self.check_available()?;
        if request.raw_handle.is_empty() {
            return Err(Status::invalid_argument("empty CUDA IPC handle").into());
        }
        self.state.lock().cuda_regions.insert(
            request.name.clone(),
            pb::cuda_shared_memory_status_response::RegionStatus {
                name: request.name,
                device_id: request.device_id as u64,
                byte_size: request.byte_size,
            },
        );
        Ok(pb::CudaSharedMemoryRegisterResponse {})
    }

    async fn cuda_shared_memory_unregister(
        &self,
        request: pb::CudaSharedMemoryUnregisterRequest,
    ) -> Result<pb::CudaSharedMemoryUnregisterResponse> {
        self.check_available()?;
        let mut state = self.state.lock();
        if request.name.is_empty() {
            state.cuda_regions.clear();
        } else {
            state.cuda_regions.remove(&request.name);
        }
        Ok(pb::CudaSharedMemoryUnregisterResponse {})
    }

    async fn trace_setting(&self, request: pb::TraceSettingRequest) -> Result<pb::TraceSettingResponse> {
        self.check_available()?;
        let mut state = self.state.lock();
        for (key, value) in request.settings {
            if value.value.is_empty() {
                state.trace.remove(&key);
            } else {
                state.trace.insert(key, value.value);
            }
        }
        let settings = state
            .trace
            .iter()
            .map(|(k, v)| {
                (k.clone(), pb::trace_setting_response::SettingValue { value: v.clone() })
            })
            .collect();
        Ok(pb::TraceSettingResponse { settings })
    }
}

/// Builds a client over `transport` with `workers` asynchronous workers.
pub fn client_with(transport: Arc<MockTransport>, workers: usize) -> InferenceClient {
    let config = ClientConfig::default().with_workers(workers);
    InferenceClient::with_transport(transport, &config).unwrap()
}

/// Host-unique shared-memory key for a test.
pub fn shm_key(test: &str) -> String {
    format!("/tritonstream-it-{}-{}", std::process::id(), test)
}
