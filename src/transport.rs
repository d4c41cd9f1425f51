//! Transport handle for the inference protocol.
//!
//! [`InferenceTransport`] is the seam between the client and the RPC layer:
//! one async method per protocol RPC, taking and returning protocol
//! messages. [`GrpcTransport`] implements it over a tonic channel; tests
//! substitute an in-memory implementation.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::inference as pb;
use crate::proto::{GrpcInferenceServiceClient, SERVICE_NAME};
use async_trait::async_trait;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Request;
use tracing::{debug, info};

/// Request/response access to an inference server.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn server_live(&self, request: pb::ServerLiveRequest) -> Result<pb::ServerLiveResponse>;

    async fn server_ready(&self, request: pb::ServerReadyRequest)
        -> Result<pb::ServerReadyResponse>;

    async fn server_metadata(
        &self,
        request: pb::ServerMetadataRequest,
    ) -> Result<pb::ServerMetadataResponse>;

    async fn model_ready(&self, request: pb::ModelReadyRequest) -> Result<pb::ModelReadyResponse>;

    async fn model_metadata(
        &self,
        request: pb::ModelMetadataRequest,
    ) -> Result<pb::ModelMetadataResponse>;

    async fn model_config(&self, request: pb::ModelConfigRequest)
        -> Result<pb::ModelConfigResponse>;

    async fn model_statistics(
        &self,
        request: pb::ModelStatisticsRequest,
    ) -> Result<pb::ModelStatisticsResponse>;

    async fn model_infer(&self, request: pb::ModelInferRequest) -> Result<pb::ModelInferResponse>;

    async fn repository_index(
        &self,
        request: pb::RepositoryIndexRequest,
    ) -> Result<pb::RepositoryIndexResponse>;

    async fn repository_model_load(
        &self,
        request: pb::RepositoryModelLoadRequest,
    ) -> Result<pb::RepositoryModelLoadResponse>;

    async fn repository_model_unload(
        &self,
        request: pb::RepositoryModelUnloadRequest,
    ) -> Result<pb::RepositoryModelUnloadResponse>;

    async fn system_shared_memory_status(
        &self,
        request: pb::SystemSharedMemoryStatusRequest,
    ) -> Result<pb::SystemSharedMemoryStatusResponse>;

    async fn system_shared_memory_register(
        &self,
        request: pb::SystemSharedMemoryRegisterRequest,
    ) -> Result<pb::SystemSharedMemoryRegisterResponse>;

    async fn system_shared_memory_unregister(
        &self,
        request: pb::SystemSharedMemoryUnregisterRequest,
    ) -> Result<pb::SystemSharedMemoryUnregisterResponse>;

    async fn cuda_shared_memory_status(
        &self,
        request: pb::CudaSharedMemoryStatusRequest,
    ) -> Result<pb::CudaSharedMemoryStatusResponse>;

    async fn cuda_shared_memory_register(
        &self,
        request: pb::CudaSharedMemoryRegisterRequest,
    ) -> Result<pb::CudaSharedMemoryRegisterResponse>;

    async fn cuda_shared_memory_unregister(
        &self,
        request: pb::CudaSharedMemoryUnregisterRequest,
    ) -> Result<pb::CudaSharedMemoryUnregisterResponse>;

    async fn trace_setting(&self, request: pb::TraceSettingRequest)
        -> Result<pb::TraceSettingResponse>;
}

/// gRPC transport over a lazily connected tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: GrpcInferenceServiceClient<Channel>,
    token: Option<MetadataValue<Ascii>>,
    request_timeout: Option<Duration>,
    max_message_size: usize,
    uri: String,
}

fn normalize_uri(url: &str, tls: bool) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if tls {
        format!("https://{}", url)
    } else {
        format!("http://{}", url)
    }
}

impl GrpcTransport {
    /// Builds the channel without connecting; the first RPC establishes the
    /// connection and reports any failure as a transport error.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_lazy(config: &ClientConfig) -> Result<Self> {
        let uri = normalize_uri(&config.url, config.tls_ca.is_some());
        debug!(uri = %uri, "Configuring inference channel");

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", uri, e)))?
            .connect_timeout(config.connect_timeout());

        if let Some(ca_path) = &config.tls_ca {
            let ca = std::fs::read(ca_path)?;
            let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));
            endpoint = endpoint.tls_config(tls)?;
        }

        let token = config
            .token
            .as_deref()
            .map(|t| format!("Bearer {}", t).parse::<MetadataValue<Ascii>>())
            .transpose()?;

        let channel = endpoint.connect_lazy();
        info!(uri = %uri, service = SERVICE_NAME, "Inference channel ready");

        // Raw tensor payloads routinely exceed tonic's 4 MiB decode default.
        let max_message_size = config.max_message_size();
        let client = GrpcInferenceServiceClient::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);

        Ok(Self {
            client,
            token,
            request_timeout: config.request_timeout(),
            max_message_size,
            uri,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        if let Some(timeout) = self.request_timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

#[async_trait]
impl InferenceTransport for GrpcTransport {
    async fn server_live(&self, request: pb::ServerLiveRequest) -> Result<pb::ServerLiveResponse> {
        let response = self.client.clone().server_live(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn server_ready(
        &self,
        request: pb::ServerReadyRequest,
    ) -> Result<pb::ServerReadyResponse> {
        let response = self.client.clone().server_ready(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn server_metadata(
        &self,
        request: pb::ServerMetadataRequest,
    ) -> Result<pb::ServerMetadataResponse> {
        let response = self.client.clone().server_metadata(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn model_ready(&self, request: pb::ModelReadyRequest) -> Result<pb::ModelReadyResponse> {
        let response = self.client.clone().model_ready(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn model_metadata(
        &self,
        request: pb::ModelMetadataRequest,
    ) -> Result<pb::ModelMetadataResponse> {
        let response = self.client.clone().model_metadata(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn model_config(
        &self,
        request: pb::ModelConfigRequest,
    ) -> Result<pb::ModelConfigResponse> {
        let response = self.client.clone().model_config(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn model_statistics(
        &self,
        request: pb::ModelStatisticsRequest,
    ) -> Result<pb::ModelStatisticsResponse> {
        let response = self.client.clone().model_statistics(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn model_infer(&self, request: pb::ModelInferRequest) -> Result<pb::ModelInferResponse> {
        let response = self.client.clone().model_infer(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn repository_index(
        &self,
        request: pb::RepositoryIndexRequest,
    ) -> Result<pb::RepositoryIndexResponse> {
        let response = self.client.clone().repository_index(self.request(request)).await?;
        Ok(response.into_inner())
    }

    async fn repository_model_load(
        &self,
        request: pb::RepositoryModelLoadRequest,
    ) -> Result<pb::RepositoryModelLoadResponse> {
        let response = self
            .client
            .clone()
            .repository_model_load(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn repository_model_unload(
        &self,
        request: pb::RepositoryModelUnloadRequest,
    ) -> Result<pb::RepositoryModelUnloadResponse> {
        let response = self
            .client
            .clone()
            .repository_model_unload(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn system_shared_memory_status(
        &self,
        request: pb::SystemSharedMemoryStatusRequest,
    ) -> Result<pb::SystemSharedMemoryStatusResponse> {
        let response = self
            .client
            .clone()
            .system_shared_memory_status(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn system_shared_memory_register(
        &self,
        request: pb::SystemSharedMemoryRegisterRequest,
    ) -> Result<pb::SystemSharedMemoryRegisterResponse> {
        let response = self
            .client
            .clone()
            .system_shared_memory_register(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn system_shared_memory_unregister(
        &self,
        request: pb::SystemSharedMemoryUnregisterRequest,
    ) -> Result<pb::SystemSharedMemoryUnregisterResponse> {
        let response = self
            .client
            .clone()
            .system_shared_memory_unregister(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn cuda_shared_memory_status(
        &self,
        request: pb::CudaSharedMemoryStatusRequest,
    ) -> Result<pb::CudaSharedMemoryStatusResponse> {
        let response = self
            .client
            .clone()
            .cuda_shared_memory_status(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn cuda_shared_memory_register(
        &self,
        request: pb::CudaSharedMemoryRegisterRequest,
    ) -> Result<pb::CudaSharedMemoryRegisterResponse> {
        let response = self
            .client
            .clone()
            .cuda_shared_memory_register(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn cuda_shared_memory_unregister(
        &self,
        request: pb::CudaSharedMemoryUnregisterRequest,
    ) -> Result<pb::CudaSharedMemoryUnregisterResponse> {
        let response = self
            .client
            .clone()
            .cuda_shared_memory_unregister(self.request(request))
            .await?;
        Ok(response.into_inner())
    }

    async fn trace_setting(
        &self,
        request: pb::TraceSettingRequest,
    ) -> Result<pb::TraceSettingResponse> {
        let response = self.client.clone().trace_setting(self.request(request)).await?;
        Ok(response.into_inner())
    }
}
