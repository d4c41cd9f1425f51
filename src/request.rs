//! Inference request builders.
//!
//! An [`InferRequest`] collects [`InferInput`]s, optional
//! [`InferRequestedOutput`]s and request parameters, and is turned into the
//! protocol message by [`InferRequest::to_proto`]. Inline input data is
//! encoded into typed tensor contents as soon as it is set; shared-memory
//! inputs carry no payload and are described by reserved parameters instead.

use crate::error::{Error, Result};
use crate::proto::inference::model_infer_request::{InferInputTensor, InferRequestedOutputTensor};
use crate::proto::inference::{
    infer_parameter::ParameterChoice, InferParameter, InferTensorContents, ModelInferRequest,
};
use crate::tensor::codec::to_contents;
use crate::tensor::{element_count, Datatype, TensorData};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Reserved parameter naming the shared-memory region of a tensor.
pub const SHARED_MEMORY_REGION: &str = "shared_memory_region";
/// Reserved parameter carrying the tensor's byte size inside the region.
pub const SHARED_MEMORY_BYTE_SIZE: &str = "shared_memory_byte_size";
/// Reserved parameter carrying the tensor's offset inside the region.
pub const SHARED_MEMORY_OFFSET: &str = "shared_memory_offset";
/// Reserved output parameter requesting top-k classification.
pub const CLASSIFICATION: &str = "classification";

const SEQUENCE_ID: &str = "sequence_id";
const SEQUENCE_START: &str = "sequence_start";
const SEQUENCE_END: &str = "sequence_end";
const PRIORITY: &str = "priority";
const TIMEOUT: &str = "timeout";

const RESERVED_REQUEST_PARAMETERS: [&str; 6] = [
    SEQUENCE_ID,
    SEQUENCE_START,
    SEQUENCE_END,
    PRIORITY,
    TIMEOUT,
    "binary_data_output",
];

/// Scalar value of a request, tensor or response parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Parameter {
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
}

impl From<bool> for Parameter {
    fn from(v: bool) -> Self {
        Parameter::Bool(v)
    }
}

impl From<i64> for Parameter {
    fn from(v: i64) -> Self {
        Parameter::Int64(v)
    }
}

impl From<u64> for Parameter {
    fn from(v: u64) -> Self {
        Parameter::Uint64(v)
    }
}

impl From<f64> for Parameter {
    fn from(v: f64) -> Self {
        Parameter::Double(v)
    }
}

impl From<String> for Parameter {
    fn from(v: String) -> Self {
        Parameter::String(v)
    }
}

impl From<&str> for Parameter {
    fn from(v: &str) -> Self {
        Parameter::String(v.to_string())
    }
}

impl Parameter {
    pub fn to_proto(&self) -> InferParameter {
        let choice = match self {
            Parameter::Bool(v) => ParameterChoice::BoolParam(*v),
            Parameter::Int64(v) => ParameterChoice::Int64Param(*v),
            Parameter::Uint64(v) => ParameterChoice::Uint64Param(*v),
            Parameter::Double(v) => ParameterChoice::DoubleParam(*v),
            Parameter::String(v) => ParameterChoice::StringParam(v.clone()),
        };
        InferParameter {
            parameter_choice: Some(choice),
        }
    }

    /// `None` when the message carries no value.
    pub fn from_proto(param: &InferParameter) -> Option<Self> {
        let value = match param.parameter_choice.as_ref()? {
            ParameterChoice::BoolParam(v) => Parameter::Bool(*v),
            ParameterChoice::Int64Param(v) => Parameter::Int64(*v),
            ParameterChoice::Uint64Param(v) => Parameter::Uint64(*v),
            ParameterChoice::DoubleParam(v) => Parameter::Double(*v),
            ParameterChoice::StringParam(v) => Parameter::String(v.clone()),
        };
        Some(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Parameter::String(v) => Some(v),
            _ => None,
        }
    }

    /// Unsigned view of integer parameters; negative values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Parameter::Uint64(v) => Some(*v),
            Parameter::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

fn params_to_proto(params: &HashMap<String, Parameter>) -> HashMap<String, InferParameter> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_proto()))
        .collect()
}

/// Location of a tensor inside a registered shared-memory region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedMemoryRef {
    pub region: String,
    pub byte_size: u64,
    pub offset: u64,
}

impl SharedMemoryRef {
    pub fn new(region: impl Into<String>, byte_size: u64, offset: u64) -> Self {
        Self {
            region: region.into(),
            byte_size,
            offset,
        }
    }

    /// Adds the reserved shared-memory parameters. The offset is only sent
    /// when nonzero.
    pub(crate) fn append_parameters(&self, params: &mut HashMap<String, InferParameter>) {
        params.insert(
            SHARED_MEMORY_REGION.to_string(),
            Parameter::String(self.region.clone()).to_proto(),
        );
        params.insert(
            SHARED_MEMORY_BYTE_SIZE.to_string(),
            Parameter::Uint64(self.byte_size).to_proto(),
        );
        if self.offset > 0 {
            params.insert(
                SHARED_MEMORY_OFFSET.to_string(),
                Parameter::Uint64(self.offset).to_proto(),
            );
        }
    }

    /// Recovers a reference from tensor parameters, `None` when the tensor is
    /// not backed by shared memory.
    pub(crate) fn from_parameters(params: &HashMap<String, InferParameter>) -> Result<Option<Self>> {
        let Some(region) = params.get(SHARED_MEMORY_REGION).and_then(Parameter::from_proto) else {
            return Ok(None);
        };
        let region = region
            .as_str()
            .ok_or_else(|| Error::InvalidData(format!("{} must be a string", SHARED_MEMORY_REGION)))?
            .to_string();

        let unsigned = |key: &str| -> Result<Option<u64>> {
            match params.get(key).and_then(Parameter::from_proto) {
                None => Ok(None),
                Some(p) => p.as_u64().map(Some).ok_or_else(|| {
                    Error::InvalidData(format!("{} must be a non-negative integer", key))
                }),
            }
        };
        let byte_size = unsigned(SHARED_MEMORY_BYTE_SIZE)?.ok_or_else(|| {
            Error::InvalidData(format!(
                "{} present without {}",
                SHARED_MEMORY_REGION, SHARED_MEMORY_BYTE_SIZE
            ))
        })?;
        let offset = unsigned(SHARED_MEMORY_OFFSET)?.unwrap_or(0);

        Ok(Some(Self {
            region,
            byte_size,
            offset,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum InputPayload {
    Unset,
    Inline {
        contents: InferTensorContents,
        len: usize,
    },
    SharedMemory(SharedMemoryRef),
}

/// One input tensor of an inference request.
///
/// Exactly one payload is active: setting inline data clears a shared-memory
/// reference and vice versa.
#[derive(Debug, Clone, PartialEq)]
pub struct InferInput {
    name: String,
    datatype: Datatype,
    shape: Vec<i64>,
    payload: InputPayload,
    parameters: HashMap<String, Parameter>,
}

impl InferInput {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<i64>>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            shape: shape.into(),
            payload: InputPayload::Unset,
            parameters: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Replaces the shape. Inline data already set is re-validated when the
    /// request is built.
    pub fn set_shape(&mut self, shape: impl Into<Vec<i64>>) -> &mut Self {
        self.shape = shape.into();
        self
    }

    /// Sets inline data, encoding it immediately.
    ///
    /// Fails with [`Error::ShapeMismatch`] if the element count does not
    /// match the shape, or [`Error::InvalidData`] on a datatype mismatch.
    pub fn set_data(&mut self, data: impl Into<TensorData>) -> Result<&mut Self> {
        let data = data.into();
        crate::tensor::check_consistent(self.datatype, &self.shape, &data)?;
        let len = data.len();
        let contents = to_contents(self.datatype, data)?;
        self.payload = InputPayload::Inline { contents, len };
        Ok(self)
    }

    /// Points the input at a registered shared-memory region.
    pub fn set_shared_memory(
        &mut self,
        region: impl Into<String>,
        byte_size: u64,
        offset: u64,
    ) -> &mut Self {
        self.payload = InputPayload::SharedMemory(SharedMemoryRef::new(region, byte_size, offset));
        self
    }

    pub fn shared_memory(&self) -> Option<&SharedMemoryRef> {
        match &self.payload {
            InputPayload::SharedMemory(shm) => Some(shm),
            _ => None,
        }
    }

    pub fn has_inline_data(&self) -> bool {
        matches!(self.payload, InputPayload::Inline { .. })
    }

    /// Attaches a user parameter to this tensor.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<Parameter>) -> &mut Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn to_proto(&self) -> Result<InferInputTensor> {
        let mut tensor = InferInputTensor {
            name: self.name.clone(),
            datatype: self.datatype.as_str().to_string(),
            shape: self.shape.clone(),
            parameters: params_to_proto(&self.parameters),
            contents: None,
        };

        match &self.payload {
            InputPayload::Unset => {
                return Err(Error::InvalidData(format!(
                    "input '{}' has neither data nor a shared memory region",
                    self.name
                )));
            }
            InputPayload::Inline { contents, len } => {
                let expected = element_count(&self.shape)?;
                if *len != expected {
                    return Err(Error::ShapeMismatch(format!(
                        "input '{}' has shape {:?} ({} elements) but {} elements of data",
                        self.name, self.shape, expected, len
                    )));
                }
                tensor.contents = Some(contents.clone());
            }
            InputPayload::SharedMemory(shm) => shm.append_parameters(&mut tensor.parameters),
        }

        Ok(tensor)
    }
}

/// An output the caller wants returned, optionally into shared memory.
#[derive(Debug, Clone, PartialEq)]
pub struct InferRequestedOutput {
    name: String,
    class_count: u32,
    shared_memory: Option<SharedMemoryRef>,
}

impl InferRequestedOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_count: 0,
            shared_memory: None,
        }
    }

    /// Requests the top `class_count` classifications instead of raw values.
    pub fn with_class_count(mut self, class_count: u32) -> Self {
        self.class_count = class_count;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_count(&self) -> u32 {
        self.class_count
    }

    pub fn set_shared_memory(
        &mut self,
        region: impl Into<String>,
        byte_size: u64,
        offset: u64,
    ) -> &mut Self {
        self.shared_memory = Some(SharedMemoryRef::new(region, byte_size, offset));
        self
    }

    /// Reverts to inline delivery in the response.
    pub fn unset_shared_memory(&mut self) -> &mut Self {
        self.shared_memory = None;
        self
    }

    pub fn shared_memory(&self) -> Option<&SharedMemoryRef> {
        self.shared_memory.as_ref()
    }

    pub fn to_proto(&self) -> InferRequestedOutputTensor {
        let mut parameters = HashMap::new();
        if self.class_count > 0 {
            parameters.insert(
                CLASSIFICATION.to_string(),
                Parameter::Int64(i64::from(self.class_count)).to_proto(),
            );
        }
        if let Some(shm) = &self.shared_memory {
            shm.append_parameters(&mut parameters);
        }
        InferRequestedOutputTensor {
            name: self.name.clone(),
            parameters,
        }
    }
}

/// Correlation ID of a sequence-batched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceId {
    Numeric(u64),
    Text(String),
}

impl From<u64> for SequenceId {
    fn from(v: u64) -> Self {
        SequenceId::Numeric(v)
    }
}

impl From<&str> for SequenceId {
    fn from(v: &str) -> Self {
        SequenceId::Text(v.to_string())
    }
}

impl From<String> for SequenceId {
    fn from(v: String) -> Self {
        SequenceId::Text(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Sequence {
    id: SequenceId,
    start: bool,
    end: bool,
}

/// A complete inference request.
///
/// ```rust,ignore
/// let mut input = InferInput::new("input", vec![1, 4], Datatype::Fp32);
/// input.set_data(vec![0.0f32, 1.0, 2.0, 3.0])?;
/// let request = InferRequest::new("simple")
///     .with_input(input)
///     .with_output(InferRequestedOutput::new("output"));
/// let result = client.infer(&request)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InferRequest {
    model_name: String,
    model_version: String,
    id: String,
    inputs: Vec<InferInput>,
    outputs: Vec<InferRequestedOutput>,
    parameters: HashMap<String, Parameter>,
    sequence: Option<Sequence>,
    priority: Option<u64>,
    timeout: Option<Duration>,
}

impl InferRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_version: String::new(),
            id: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: HashMap::new(),
            sequence: None,
            priority: None,
            timeout: None,
        }
    }

    /// Pins a model version; empty means the server's latest.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_input(mut self, input: InferInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: InferRequestedOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Marks the request as part of a sequence for stateful models.
    pub fn with_sequence(mut self, id: impl Into<SequenceId>, start: bool, end: bool) -> Self {
        self.sequence = Some(Sequence {
            id: id.into(),
            start,
            end,
        });
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Server-side timeout, sent in microseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Parameter>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inputs(&self) -> &[InferInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[InferRequestedOutput] {
        &self.outputs
    }

    pub fn inputs_mut(&mut self) -> &mut [InferInput] {
        &mut self.inputs
    }

    pub fn outputs_mut(&mut self) -> &mut [InferRequestedOutput] {
        &mut self.outputs
    }

    /// Builds the protocol message.
    ///
    /// Fails on user parameters that collide with reserved keys, on duplicate
    /// input names and on inputs without a payload.
    pub fn to_proto(&self) -> Result<ModelInferRequest> {
        if let Some(key) = self
            .parameters
            .keys()
            .find(|k| RESERVED_REQUEST_PARAMETERS.contains(&k.as_str()))
        {
            return Err(Error::InvalidData(format!(
                "parameter '{}' is reserved; use the dedicated builder method",
                key
            )));
        }

        let mut seen = HashSet::new();
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !seen.insert(input.name()) {
                return Err(Error::InvalidData(format!(
                    "duplicate input '{}'",
                    input.name()
                )));
            }
            inputs.push(input.to_proto()?);
        }

        let mut parameters = params_to_proto(&self.parameters);
        if let Some(sequence) = &self.sequence {
            let id = match &sequence.id {
                SequenceId::Numeric(v) => Parameter::Uint64(*v),
                SequenceId::Text(v) => Parameter::String(v.clone()),
            };
            parameters.insert(SEQUENCE_ID.to_string(), id.to_proto());
            parameters.insert(
                SEQUENCE_START.to_string(),
                Parameter::Bool(sequence.start).to_proto(),
            );
            parameters.insert(
                SEQUENCE_END.to_string(),
                Parameter::Bool(sequence.end).to_proto(),
            );
        }
        if let Some(priority) = self.priority {
            parameters.insert(PRIORITY.to_string(), Parameter::Uint64(priority).to_proto());
        }
        if let Some(timeout) = self.timeout {
            let micros = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);
            parameters.insert(TIMEOUT.to_string(), Parameter::Int64(micros).to_proto());
        }

        Ok(ModelInferRequest {
            model_name: self.model_name.clone(),
            model_version: self.model_version.clone(),
            id: self.id.clone(),
            parameters,
            inputs,
            outputs: self.outputs.iter().map(InferRequestedOutput::to_proto).collect(),
            raw_input_contents: Vec::new(),
        })
    }
}
