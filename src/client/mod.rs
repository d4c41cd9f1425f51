//! Synchronous inference client.
//!
//! [`InferenceClient`] owns a small tokio runtime that drives the transport,
//! plus a fixed-size [`pool`] of worker threads for [`InferenceClient::async_infer`].
//! All public methods block the calling thread and must not be called from
//! inside an async task.
//!
//! # Example
//!
//! ```rust,ignore
//! use tritonstream_core::{Datatype, InferInput, InferRequest, InferenceClient};
//!
//! let client = InferenceClient::connect("localhost:8001")?;
//! assert!(client.server_live()?);
//!
//! let mut input = InferInput::new("input", vec![1, 2, 2, 3], Datatype::Fp32);
//! input.set_data((0..12).map(|x| x as f32).collect::<Vec<_>>())?;
//! let result = client.infer(&InferRequest::new("simple").with_input(input))?;
//! let output = result.as_data("output")?;
//! ```

pub mod pool;

pub use pool::{CallContext, CallStatus};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metadata::{
    sorted_regions, CudaRegionStatus, ModelConfig, ModelIndex, ModelMetadata, ModelStatistics,
    ServerMetadata, SystemRegionStatus, TraceSettings,
};
use crate::proto::inference as pb;
use crate::request::InferRequest;
use crate::response::InferResult;
use crate::shm::SharedMemoryRegion;
use crate::transport::{GrpcTransport, InferenceTransport};
use pool::WorkerPool;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

/// Client for a KServe v2 / Triton inference server.
///
/// The client is `Send + Sync`; share it behind an `Arc` to issue calls from
/// several threads.
pub struct InferenceClient {
    runtime: Option<Runtime>,
    transport: Arc<dyn InferenceTransport>,
    pool: WorkerPool,
    closed: AtomicBool,
}

fn version_string(version: Option<&str>) -> String {
    version.unwrap_or_default().to_string()
}

async fn run_infer(
    transport: &dyn InferenceTransport,
    request: &InferRequest,
) -> Result<InferResult> {
    let proto = request.to_proto()?;
    let response = transport.model_infer(proto).await?;
    InferResult::from_proto(response)
}

impl InferenceClient {
    /// Connects to `url` with default settings.
    pub fn connect(url: impl Into<String>) -> Result<Self> {
        Self::with_config(ClientConfig::new(url))
    }

    /// Builds a gRPC client from `config`.
    ///
    /// The channel connects lazily: an unreachable server is reported by the
    /// first call, not here.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Self::build_runtime(&config)?;
        let transport = {
            let _guard = runtime.enter();
            GrpcTransport::connect_lazy(&config)?
        };
        info!(url = %config.url, workers = config.workers, "Created inference client");
        Self::assemble(runtime, Arc::new(transport), config.workers)
    }

    /// Builds a client over any transport implementation.
    pub fn with_transport(
        transport: Arc<dyn InferenceTransport>,
        config: &ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Self::build_runtime(config)?;
        Self::assemble(runtime, transport, config.workers)
    }

    fn build_runtime(config: &ClientConfig) -> Result<Runtime> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("tritonstream-io")
            .enable_all()
            .build()?;
        Ok(runtime)
    }

    fn assemble(
        runtime: Runtime,
        transport: Arc<dyn InferenceTransport>,
        workers: usize,
    ) -> Result<Self> {
        Ok(Self {
            runtime: Some(runtime),
            transport,
            pool: WorkerPool::new(workers)?,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn block_on<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let runtime = self.runtime.as_ref().ok_or(Error::Closed)?;
        runtime.block_on(future)
    }

    /// Whether the server process is up. Network failures are errors, never
    /// `false`.
    pub fn server_live(&self) -> Result<bool> {
        let response = self.block_on(self.transport.server_live(pb::ServerLiveRequest {}))?;
        Ok(response.live)
    }

    /// Whether the server is ready to accept inference requests.
    pub fn server_ready(&self) -> Result<bool> {
        let response = self.block_on(self.transport.server_ready(pb::ServerReadyRequest {}))?;
        Ok(response.ready)
    }

    pub fn server_metadata(&self) -> Result<ServerMetadata> {
        let response =
            self.block_on(self.transport.server_metadata(pb::ServerMetadataRequest {}))?;
        Ok(response.into())
    }

    /// Whether `name` (at `version`, or the latest) can serve requests.
    pub fn model_ready(&self, name: &str, version: Option<&str>) -> Result<bool> {
        let request = pb::ModelReadyRequest {
            name: name.to_string(),
            version: version_string(version),
        };
        let response = self.block_on(self.transport.model_ready(request))?;
        Ok(response.ready)
    }

    pub fn model_metadata(&self, name: &str, version: Option<&str>) -> Result<ModelMetadata> {
        let request = pb::ModelMetadataRequest {
            name: name.to_string(),
            version: version_string(version),
        };
        let response = self.block_on(self.transport.model_metadata(request))?;
        Ok(response.into())
    }

    pub fn model_config(&self, name: &str, version: Option<&str>) -> Result<ModelConfig> {
        let request = pb::ModelConfigRequest {
            name: name.to_string(),
            version: version_string(version),
        };
        let response = self.block_on(self.transport.model_config(request))?;
        response.config.map(Into::into).ok_or_else(|| {
            Error::InvalidData(format!("server returned no configuration for '{}'", name))
        })
    }

    /// Statistics for `name`, or for every model when `name` is empty.
    pub fn model_statistics(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Vec<ModelStatistics>> {
        let request = pb::ModelStatisticsRequest {
            name: name.to_string(),
            version: version_string(version),
        };
        let response = self.block_on(self.transport.model_statistics(request))?;
        Ok(response.model_stats.into_iter().map(Into::into).collect())
    }

    /// Runs one inference and blocks until it completes.
    ///
    /// Every failure, including request construction, is reported as
    /// [`Error::Inference`] wrapping the cause. Nothing is retried.
    pub fn infer(&self, request: &InferRequest) -> Result<InferResult> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        debug!(model = %request.model_name(), id = %request.id(), "Dispatching inference");
        self.block_on(run_infer(self.transport.as_ref(), request))
            .map_err(Error::into_inference)
    }

    /// Queues an inference on the worker pool and returns immediately.
    ///
    /// `on_complete` runs exactly once on a worker thread with the result or
    /// an [`Error::Inference`] / [`Error::Cancelled`]. Completion order is
    /// unrelated to submission order. Fails with [`Error::Closed`] after
    /// [`InferenceClient::close`], without invoking `on_complete`.
    pub fn async_infer<F>(&self, request: &InferRequest, on_complete: F) -> Result<CallContext>
    where
        F: FnOnce(Result<InferResult>) + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let handle = self.runtime.as_ref().ok_or(Error::Closed)?.handle().clone();
        let transport = Arc::clone(&self.transport);
        let request = request.clone();

        let ctx = self.pool.submit(
            move || {
                handle
                    .block_on(run_infer(transport.as_ref(), &request))
                    .map_err(Error::into_inference)
            },
            on_complete,
        )?;
        debug!(call_id = ctx.id(), "Submitted asynchronous inference");
        Ok(ctx)
    }

    /// Registers a system shared-memory region with the server.
    pub fn register_system_shared_memory(
        &self,
        name: &str,
        key: &str,
        byte_size: u64,
        offset: u64,
    ) -> Result<()> {
        let request = pb::SystemSharedMemoryRegisterRequest {
            name: name.to_string(),
            key: key.to_string(),
            offset,
            byte_size,
        };
        self.block_on(self.transport.system_shared_memory_register(request))?;
        info!(region = name, key, byte_size, offset, "Registered system shared memory");
        Ok(())
    }

    /// Registers an attached region under its own name and key.
    pub fn register_region(&self, region: &SharedMemoryRegion) -> Result<()> {
        if !region.is_attached() {
            return Err(Error::RegionDetached(region.key().to_string()));
        }
        self.register_system_shared_memory(region.name(), region.key(), region.byte_size(), 0)
    }

    /// Unregisters `name`, or every system region when `None`.
    pub fn unregister_system_shared_memory(&self, name: Option<&str>) -> Result<()> {
        let request = pb::SystemSharedMemoryUnregisterRequest {
            name: name.unwrap_or_default().to_string(),
        };
        self.block_on(self.transport.system_shared_memory_unregister(request))?;
        info!(region = name.unwrap_or("<all>"), "Unregistered system shared memory");
        Ok(())
    }

    /// Status of `name`, or of every registered system region, sorted by name.
    pub fn system_shared_memory_status(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<SystemRegionStatus>> {
        let request = pb::SystemSharedMemoryStatusRequest {
            name: name.unwrap_or_default().to_string(),
        };
        let response = self.block_on(self.transport.system_shared_memory_status(request))?;
        Ok(sorted_regions(response.regions))
    }

    /// Unregisters the region from the server, then unmaps and unlinks it.
    pub fn release_region(&self, region: &mut SharedMemoryRegion) -> Result<()> {
        self.unregister_system_shared_memory(Some(region.name()))?;
        region.detach();
        region.unlink()
    }

    /// Registers a CUDA IPC memory handle with the server.
    pub fn register_cuda_shared_memory(
        &self,
        name: &str,
        raw_handle: Vec<u8>,
        device_id: i64,
        byte_size: u64,
    ) -> Result<()> {
        let request = pb::CudaSharedMemoryRegisterRequest {
            name: name.to_string(),
            raw_handle,
            device_id,
            byte_size,
        };
        self.block_on(self.transport.cuda_shared_memory_register(request))?;
        info!(region = name, device_id, byte_size, "Registered CUDA shared memory");
        Ok(())
    }

    /// Unregisters `name`, or every CUDA region when `None`.
    pub fn unregister_cuda_shared_memory(&self, name: Option<&str>) -> Result<()> {
        let request = pb::CudaSharedMemoryUnregisterRequest {
            name: name.unwrap_or_default().to_string(),
        };
        self.block_on(self.transport.cuda_shared_memory_unregister(request))?;
        Ok(())
    }

    pub fn cuda_shared_memory_status(&self, name: Option<&str>) -> Result<Vec<CudaRegionStatus>> {
        let request = pb::CudaSharedMemoryStatusRequest {
            name: name.unwrap_or_default().to_string(),
        };
        let response = self.block_on(self.transport.cuda_shared_memory_status(request))?;
        Ok(sorted_regions(response.regions))
    }

    /// Loads (or reloads) `name` from the model repository.
    pub fn load_model(&self, name: &str) -> Result<()> {
        let request = pb::RepositoryModelLoadRequest {
            repository_name: String::new(),
            model_name: name.to_string(),
        };
        self.block_on(self.transport.repository_model_load(request))?;
        info!(model = name, "Loaded model");
        Ok(())
    }

    pub fn unload_model(&self, name: &str) -> Result<()> {
        let request = pb::RepositoryModelUnloadRequest {
            repository_name: String::new(),
            model_name: name.to_string(),
        };
        self.block_on(self.transport.repository_model_unload(request))?;
        info!(model = name, "Unloaded model");
        Ok(())
    }

    /// Lists the models of `repository_name` (all repositories when `None`).
    pub fn repository_index(
        &self,
        repository_name: Option<&str>,
        ready_only: bool,
    ) -> Result<Vec<ModelIndex>> {
        let request = pb::RepositoryIndexRequest {
            repository_name: repository_name.unwrap_or_default().to_string(),
            ready: ready_only,
        };
        let response = self.block_on(self.transport.repository_index(request))?;
        Ok(response.models.into_iter().map(Into::into).collect())
    }

    /// Applies `updates` to the trace settings of `model` (global settings
    /// when `None`) and returns the resulting settings. An empty update
    /// only reads them.
    pub fn trace_settings(
        &self,
        model: Option<&str>,
        updates: &BTreeMap<String, Vec<String>>,
    ) -> Result<TraceSettings> {
        let request = pb::TraceSettingRequest {
            settings: updates
                .iter()
                .map(|(k, v)| (k.clone(), pb::trace_setting_request::SettingValue { value: v.clone() }))
                .collect(),
            model_name: model.unwrap_or_default().to_string(),
        };
        let response = self.block_on(self.transport.trace_setting(request))?;
        Ok(response.into())
    }

    /// Stops accepting calls and waits for every queued and running
    /// asynchronous call to finish or be cancelled. Idempotent; later calls
    /// fail with [`Error::Closed`]. Transport resources are released when the
    /// client is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing inference client");
        }
        self.pool.close();
    }
}

impl Drop for InferenceClient {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceClient")
            .field("workers", &self.pool.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}
