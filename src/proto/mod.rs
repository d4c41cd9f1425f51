//! Protocol buffer types for the KServe v2 / Triton gRPC inference protocol,
//! generated at build time from `proto/grpc_service.proto` and
//! `proto/model_config.proto`.

#[allow(clippy::derive_partial_eq_without_eq, clippy::large_enum_variant)]
pub mod inference {
    tonic::include_proto!("inference");
}

pub use inference::grpc_inference_service_client::GrpcInferenceServiceClient;
pub use inference::{InferTensorContents, ModelInferRequest, ModelInferResponse};

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "inference.GRPCInferenceService";
