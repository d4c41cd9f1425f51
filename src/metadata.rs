//! Typed results of the control-plane RPCs.
//!
//! Each type converts from its protocol message and serializes with serde, so
//! callers choose between the typed value and [`ToJson::to_json`].

use crate::error::Result;
use crate::proto::inference as pb;
use crate::tensor::Datatype;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// JSON rendering of a typed result.
pub trait ToJson: Serialize {
    fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

macro_rules! impl_to_json {
    ($($ty:ty),* $(,)?) => {
        $(impl ToJson for $ty {})*
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMetadata {
    pub name: String,
    pub version: String,
    pub extensions: Vec<String>,
}

impl From<pb::ServerMetadataResponse> for ServerMetadata {
    fn from(msg: pb::ServerMetadataResponse) -> Self {
        Self {
            name: msg.name,
            version: msg.version,
            extensions: msg.extensions,
        }
    }
}

/// Name, datatype and shape of a model input or output. `-1` marks a
/// variable-size dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorMetadata {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<i64>,
}

impl From<pb::model_metadata_response::TensorMetadata> for TensorMetadata {
    fn from(msg: pb::model_metadata_response::TensorMetadata) -> Self {
        Self {
            name: msg.name,
            datatype: msg.datatype,
            shape: msg.shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub versions: Vec<String>,
    pub platform: String,
    pub inputs: Vec<TensorMetadata>,
    pub outputs: Vec<TensorMetadata>,
}

impl From<pb::ModelMetadataResponse> for ModelMetadata {
    fn from(msg: pb::ModelMetadataResponse) -> Self {
        Self {
            name: msg.name,
            versions: msg.versions,
            platform: msg.platform,
            inputs: msg.inputs.into_iter().map(Into::into).collect(),
            outputs: msg.outputs.into_iter().map(Into::into).collect(),
        }
    }
}

/// Maps a model-configuration datatype to its tensor protocol name, falling
/// back to the configuration enum name for types the tensor protocol lacks.
fn config_datatype_name(value: i32) -> String {
    let datatype = match pb::DataType::try_from(value) {
        Ok(dt) => dt,
        Err(_) => return format!("UNKNOWN({})", value),
    };
    let mapped = match datatype {
        pb::DataType::TypeBool => Some(Datatype::Bool),
        pb::DataType::TypeUint8 => Some(Datatype::Uint8),
        pb::DataType::TypeUint16 => Some(Datatype::Uint16),
        pb::DataType::TypeUint32 => Some(Datatype::Uint32),
        pb::DataType::TypeUint64 => Some(Datatype::Uint64),
        pb::DataType::TypeInt8 => Some(Datatype::Int8),
        pb::DataType::TypeInt16 => Some(Datatype::Int16),
        pb::DataType::TypeInt32 => Some(Datatype::Int32),
        pb::DataType::TypeInt64 => Some(Datatype::Int64),
        pb::DataType::TypeFp16 => Some(Datatype::Fp16),
        pb::DataType::TypeFp32 => Some(Datatype::Fp32),
        pb::DataType::TypeFp64 => Some(Datatype::Fp64),
        pb::DataType::TypeString => Some(Datatype::Bytes),
        pb::DataType::TypeInvalid | pb::DataType::TypeBf16 => None,
    };
    match mapped {
        Some(dt) => dt.as_str().to_string(),
        None => datatype.as_str_name().to_string(),
    }
}

/// Input or output entry of a model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorConfig {
    pub name: String,
    pub datatype: String,
    pub dims: Vec<i64>,
}

impl From<pb::ModelInput> for TensorConfig {
    fn from(msg: pb::ModelInput) -> Self {
        Self {
            datatype: config_datatype_name(msg.data_type),
            name: msg.name,
            dims: msg.dims,
        }
    }
}

impl From<pb::ModelOutput> for TensorConfig {
    fn from(msg: pb::ModelOutput) -> Self {
        Self {
            datatype: config_datatype_name(msg.data_type),
            name: msg.name,
            dims: msg.dims,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub platform: String,
    pub backend: String,
    pub max_batch_size: i32,
    pub inputs: Vec<TensorConfig>,
    pub outputs: Vec<TensorConfig>,
    pub parameters: BTreeMap<String, String>,
}

impl From<pb::ModelConfig> for ModelConfig {
    fn from(msg: pb::ModelConfig) -> Self {
        Self {
            name: msg.name,
            platform: msg.platform,
            backend: msg.backend,
            max_batch_size: msg.max_batch_size,
            inputs: msg.input.into_iter().map(Into::into).collect(),
            outputs: msg.output.into_iter().map(Into::into).collect(),
            parameters: msg
                .parameters
                .into_iter()
                .map(|(k, v)| (k, v.string_value))
                .collect(),
        }
    }
}

/// Cumulative count and duration of one inference phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationStat {
    pub count: u64,
    pub ns: u64,
}

impl From<Option<pb::StatisticDuration>> for DurationStat {
    fn from(msg: Option<pb::StatisticDuration>) -> Self {
        msg.map(|d| Self {
            count: d.count,
            ns: d.ns,
        })
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferStatistics {
    pub success: DurationStat,
    pub fail: DurationStat,
    pub queue: DurationStat,
    pub compute_input: DurationStat,
    pub compute_infer: DurationStat,
    pub compute_output: DurationStat,
}

impl From<pb::InferStatistics> for InferStatistics {
    fn from(msg: pb::InferStatistics) -> Self {
        Self {
            success: msg.success.into(),
            fail: msg.fail.into(),
            queue: msg.queue.into(),
            compute_input: msg.compute_input.into(),
            compute_infer: msg.compute_infer.into(),
            compute_output: msg.compute_output.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatistics {
    pub name: String,
    pub version: String,
    /// Milliseconds since the epoch of the last inference, 0 if none.
    pub last_inference: u64,
    pub inference_count: u64,
    pub execution_count: u64,
    pub inference_stats: InferStatistics,
}

impl From<pb::ModelStatistics> for ModelStatistics {
    fn from(msg: pb::ModelStatistics) -> Self {
        Self {
            name: msg.name,
            version: msg.version,
            last_inference: msg.last_inference,
            inference_count: msg.inference_count,
            execution_count: msg.execution_count,
            inference_stats: msg.inference_stats.map(Into::into).unwrap_or_default(),
        }
    }
}

/// Entry of the model repository index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIndex {
    pub name: String,
    pub version: String,
    pub state: String,
    pub reason: String,
}

impl From<pb::repository_index_response::ModelIndex> for ModelIndex {
    fn from(msg: pb::repository_index_response::ModelIndex) -> Self {
        Self {
            name: msg.name,
            version: msg.version,
            state: msg.state,
            reason: msg.reason,
        }
    }
}

/// A system shared-memory region as registered on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemRegionStatus {
    pub name: String,
    pub key: String,
    pub offset: u64,
    pub byte_size: u64,
}

impl From<pb::system_shared_memory_status_response::RegionStatus> for SystemRegionStatus {
    fn from(msg: pb::system_shared_memory_status_response::RegionStatus) -> Self {
        Self {
            name: msg.name,
            key: msg.key,
            offset: msg.offset,
            byte_size: msg.byte_size,
        }
    }
}

/// A CUDA shared-memory region as registered on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CudaRegionStatus {
    pub name: String,
    pub device_id: u64,
    pub byte_size: u64,
}

impl From<pb::cuda_shared_memory_status_response::RegionStatus> for CudaRegionStatus {
    fn from(msg: pb::cuda_shared_memory_status_response::RegionStatus) -> Self {
        Self {
            name: msg.name,
            device_id: msg.device_id,
            byte_size: msg.byte_size,
        }
    }
}

/// Sorts a server region map by region name.
pub(crate) fn sorted_regions<P, T: From<P>>(regions: HashMap<String, P>) -> Vec<T> {
    let mut entries: Vec<_> = regions.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, v)| T::from(v)).collect()
}

/// Trace settings, each a list of values keyed by setting name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TraceSettings(pub BTreeMap<String, Vec<String>>);

impl TraceSettings {
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }
}

impl From<pb::TraceSettingResponse> for TraceSettings {
    fn from(msg: pb::TraceSettingResponse) -> Self {
        Self(
            msg.settings
                .into_iter()
                .map(|(k, v)| (k, v.value))
                .collect(),
        )
    }
}

impl_to_json!(
    ServerMetadata,
    ModelMetadata,
    ModelConfig,
    ModelStatistics,
    ModelIndex,
    SystemRegionStatus,
    CudaRegionStatus,
    TraceSettings,
);

impl<T: ToJson> ToJson for Vec<T> {}
