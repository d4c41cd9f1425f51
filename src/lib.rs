//! Typed client for KServe v2 / Triton inference servers.
//!
//! The crate is organized leaf-first:
//! - [`tensor`] - datatypes, native arrays and the tensor codec
//! - [`shm`] - system shared-memory regions for zero-copy tensor transfer
//! - [`request`] / [`response`] - inference request builders and result accessors
//! - [`metadata`] - typed control-plane results
//! - [`transport`] - the RPC seam and its gRPC implementation
//! - [`client`] - synchronous and pooled asynchronous inference

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod proto;
pub mod request;
pub mod response;
pub mod shm;
pub mod tensor;
pub mod transport;

// Re-export commonly used types
pub use client::{CallContext, CallStatus, InferenceClient};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use metadata::{
    CudaRegionStatus, ModelConfig, ModelIndex, ModelMetadata, ModelStatistics, ServerMetadata,
    SystemRegionStatus, ToJson, TraceSettings,
};
pub use request::{
    InferInput, InferRequest, InferRequestedOutput, Parameter, SequenceId, SharedMemoryRef,
};
pub use response::{InferOutput, InferResult};
pub use shm::{SharedMemoryManager, SharedMemoryRegion};
pub use tensor::{Datatype, TensorData};
pub use transport::{GrpcTransport, InferenceTransport};
