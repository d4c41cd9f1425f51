//! Inference results.

use crate::error::{Error, Result};
use crate::proto::inference::model_infer_response::InferOutputTensor;
use crate::proto::inference::{InferParameter, InferTensorContents, ModelInferResponse};
use crate::request::{Parameter, SharedMemoryRef};
use crate::shm::SharedMemoryRegion;
use crate::tensor::codec::{decode_raw, from_contents};
use crate::tensor::{Datatype, TensorData};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum OutputPayload {
    Contents(InferTensorContents),
    Raw(Vec<u8>),
    SharedMemory(SharedMemoryRef),
}

/// One output tensor of an inference result.
#[derive(Debug, Clone, PartialEq)]
pub struct InferOutput {
    name: String,
    datatype: Datatype,
    shape: Vec<i64>,
    parameters: HashMap<String, Parameter>,
    payload: OutputPayload,
}

fn params_from_proto(params: &HashMap<String, InferParameter>) -> HashMap<String, Parameter> {
    params
        .iter()
        .filter_map(|(k, v)| Parameter::from_proto(v).map(|p| (k.clone(), p)))
        .collect()
}

impl InferOutput {
    fn from_proto(tensor: InferOutputTensor, raw: Option<Vec<u8>>) -> Result<Self> {
        let datatype: Datatype = tensor.datatype.parse()?;
        let payload = match SharedMemoryRef::from_parameters(&tensor.parameters)? {
            Some(shm) => OutputPayload::SharedMemory(shm),
            None => match raw {
                Some(bytes) => OutputPayload::Raw(bytes),
                None => OutputPayload::Contents(tensor.contents.unwrap_or_default()),
            },
        };

        Ok(Self {
            parameters: params_from_proto(&tensor.parameters),
            name: tensor.name,
            datatype,
            shape: tensor.shape,
            payload,
        })
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

    pub fn parameters(&self) -> &HashMap<String, Parameter> {
        &self.parameters
    }

    /// Set when the server wrote this output into a shared-memory region.
    pub fn shared_memory(&self) -> Option<&SharedMemoryRef> {
        match &self.payload {
            OutputPayload::SharedMemory(shm) => Some(shm),
            _ => None,
        }
    }

    /// Decodes an output delivered in the response itself.
    ///
    /// Outputs placed in shared memory must be read with
    /// [`InferOutput::read_from`].
    pub fn as_data(&self) -> Result<TensorData> {
        match &self.payload {
            OutputPayload::Contents(contents) => from_contents(self.datatype, contents, &self.shape),
            OutputPayload::Raw(bytes) => decode_raw(self.datatype, bytes, &self.shape),
            OutputPayload::SharedMemory(shm) => Err(Error::InvalidData(format!(
                "output '{}' was written to shared memory region '{}'",
                self.name, shm.region
            ))),
        }
    }

    /// Reads a shared-memory output from `region`, which must be the region
    /// named in the response.
    pub fn read_from(&self, region: &SharedMemoryRegion) -> Result<TensorData> {
        let shm = self.shared_memory().ok_or_else(|| {
            Error::InvalidData(format!("output '{}' is not in shared memory", self.name))
        })?;
        if shm.region != region.name() {
            return Err(Error::InvalidData(format!(
                "output '{}' lives in region '{}', not '{}'",
                self.name,
                shm.region,
                region.name()
            )));
        }
        region.read_window(self.datatype, &self.shape, shm.offset, shm.byte_size)
    }

    fn to_json(&self) -> Result<Value> {
        let mut obj = Map::new();
        obj.insert("name".into(), json!(self.name));
        obj.insert("datatype".into(), json!(self.datatype));
        obj.insert("shape".into(), json!(self.shape));
        if !self.parameters.is_empty() {
            obj.insert("parameters".into(), serde_json::to_value(&self.parameters)?);
        }
        match self.shared_memory() {
            Some(shm) => {
                obj.insert("shared_memory".into(), serde_json::to_value(shm)?);
            }
            None => {
                obj.insert("data".into(), data_to_json(&self.as_data()?));
            }
        }
        Ok(Value::Object(obj))
    }
}

fn data_to_json(data: &TensorData) -> Value {
    match data {
        TensorData::Bool(v) => json!(v),
        TensorData::Int8(v) => json!(v),
        TensorData::Int16(v) => json!(v),
        TensorData::Int32(v) => json!(v),
        TensorData::Int64(v) => json!(v),
        TensorData::Uint8(v) => json!(v),
        TensorData::Uint16(v) => json!(v),
        TensorData::Uint32(v) => json!(v),
        TensorData::Uint64(v) => json!(v),
        TensorData::Fp16(v) => json!(v.iter().map(|x| x.to_f32()).collect::<Vec<_>>()),
        TensorData::Fp32(v) => json!(v),
        TensorData::Fp64(v) => json!(v),
        TensorData::Bytes(v) => Value::Array(
            v.iter()
                .map(|e| match std::str::from_utf8(e) {
                    Ok(s) => json!(s),
                    Err(_) => json!(e),
                })
                .collect(),
        ),
    }
}

/// Immutable result of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferResult {
    model_name: String,
    model_version: String,
    id: String,
    parameters: HashMap<String, Parameter>,
    outputs: Vec<InferOutput>,
}

impl InferResult {
    /// Parses a response message.
    ///
    /// When `raw_output_contents` is populated it holds one entry per output,
    /// in output order, in the raw native-width layout.
    pub fn from_proto(response: ModelInferResponse) -> Result<Self> {
        let ModelInferResponse {
            model_name,
            model_version,
            id,
            parameters,
            outputs,
            raw_output_contents,
        } = response;

        if !raw_output_contents.is_empty() && raw_output_contents.len() != outputs.len() {
            return Err(Error::InvalidData(format!(
                "response has {} outputs but {} raw output buffers",
                outputs.len(),
                raw_output_contents.len()
            )));
        }

        let mut raw = raw_output_contents.into_iter();
        let outputs = outputs
            .into_iter()
            .map(|tensor| InferOutput::from_proto(tensor, raw.next()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            model_name,
            model_version,
            id,
            parameters: params_from_proto(&parameters),
            outputs,
        })
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

    pub fn parameters(&self) -> &HashMap<String, Parameter> {
        &self.parameters
    }

    pub fn outputs(&self) -> &[InferOutput] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&InferOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    fn require(&self, name: &str) -> Result<&InferOutput> {
        self.output(name).ok_or_else(|| {
            Error::InvalidData(format!(
                "model '{}' returned no output named '{}'",
                self.model_name, name
            ))
        })
    }

    /// Decodes the inline output `name`.
    pub fn as_data(&self, name: &str) -> Result<TensorData> {
        self.require(name)?.as_data()
    }

    /// Reads the shared-memory output `name` from `region`.
    pub fn read_output(&self, name: &str, region: &SharedMemoryRegion) -> Result<TensorData> {
        self.require(name)?.read_from(region)
    }

    /// JSON view of the result. Inline outputs include their decoded data;
    /// shared-memory outputs include their region reference instead.
    pub fn to_json(&self) -> Result<Value> {
        let outputs = self
            .outputs
            .iter()
            .map(InferOutput::to_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "model_name": self.model_name,
            "model_version": self.model_version,
            "id": self.id,
            "parameters": self.parameters,
            "outputs": outputs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{SHARED_MEMORY_BYTE_SIZE, SHARED_MEMORY_REGION};
    use crate::tensor::codec::{encode_raw, to_contents};

    fn output(name: &str, datatype: &str, shape: Vec<i64>) -> InferOutputTensor {
        InferOutputTensor {
            name: name.into(),
            datatype: datatype.into(),
            shape,
            ..Default::default()
        }
    }

    #[test]
    fn test_typed_contents_output() {
        let mut tensor = output("probs", "FP32", vec![1, 3]);
        tensor.contents = Some(to_contents(Datatype::Fp32, vec![0.1f32, 0.2, 0.7].into()).unwrap());
        let response = ModelInferResponse {
            model_name: "classifier".into(),
            model_version: "1".into(),
            outputs: vec![tensor],
            ..Default::default()
        };

        let result = InferResult::from_proto(response).unwrap();
        assert_eq!(result.model_name(), "classifier");
        assert_eq!(result.output("probs").unwrap().shape(), &[1, 3]);
        assert_eq!(
            result.as_data("probs").unwrap(),
            TensorData::Fp32(vec![0.1, 0.2, 0.7])
        );
        assert!(matches!(result.as_data("missing"), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_raw_output_contents_are_positional() {
        let a = TensorData::Int8(vec![-1, 2]);
        let b = TensorData::Fp16(vec![half::f16::from_f32(1.5)]);
        let response = ModelInferResponse {
            model_name: "m".into(),
            outputs: vec![output("a", "INT8", vec![2]), output("b", "FP16", vec![1])],
            raw_output_contents: vec![
                encode_raw(Datatype::Int8, &a).unwrap(),
                encode_raw(Datatype::Fp16, &b).unwrap(),
            ],
            ..Default::default()
        };

        let result = InferResult::from_proto(response).unwrap();
        assert_eq!(result.as_data("a").unwrap(), a);
        assert_eq!(result.as_data("b").unwrap(), b);
    }

    #[test]
    fn test_raw_count_mismatch_rejected() {
        let response = ModelInferResponse {
            outputs: vec![output("a", "INT32", vec![1]), output("b", "INT32", vec![1])],
            raw_output_contents: vec![vec![0; 4]],
            ..Default::default()
        };
        assert!(matches!(
            InferResult::from_proto(response),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_unknown_datatype_rejected() {
        let response = ModelInferResponse {
            outputs: vec![output("a", "BF16", vec![1])],
            ..Default::default()
        };
        assert!(matches!(
            InferResult::from_proto(response),
            Err(Error::UnsupportedDatatype(_))
        ));
    }

    #[test]
    fn test_shared_memory_output_is_not_inline() {
        let mut tensor = output("out", "INT32", vec![4]);
        tensor.parameters.insert(
            SHARED_MEMORY_REGION.into(),
            Parameter::from("out_region").to_proto(),
        );
        tensor.parameters.insert(
            SHARED_MEMORY_BYTE_SIZE.into(),
            Parameter::from(16u64).to_proto(),
        );
        let response = ModelInferResponse {
            outputs: vec![tensor],
            ..Default::default()
        };

        let result = InferResult::from_proto(response).unwrap();
        let out = result.output("out").unwrap();
        assert_eq!(out.shared_memory().unwrap().region, "out_region");
        assert!(matches!(out.as_data(), Err(Error::InvalidData(_))));

        let json = result.to_json().unwrap();
        assert_eq!(json["outputs"][0]["shared_memory"]["region"], "out_region");
        assert!(json["outputs"][0].get("data").is_none());
    }

    #[test]
    fn test_shared_memory_bytes_read_is_bounded_by_byte_size() {
        let key = format!("/tritonstream-response-{}-words", std::process::id());
        let mut region = SharedMemoryRegion::create("words", key.as_str(), 64).unwrap();
        let used = region.write_tensor(&vec!["ab".to_string()].into(), 0).unwrap();
        region.write_tensor(&vec!["cd".to_string()].into(), used).unwrap();

        let shm_output = |elements: i64| {
            let mut tensor = output("words", "BYTES", vec![elements]);
            tensor
                .parameters
                .insert(SHARED_MEMORY_REGION.into(), Parameter::from("words").to_proto());
            tensor
                .parameters
                .insert(SHARED_MEMORY_BYTE_SIZE.into(), Parameter::from(used).to_proto());
            InferResult::from_proto(ModelInferResponse {
                outputs: vec![tensor],
                ..Default::default()
            })
            .unwrap()
        };

        // The second element lies past the reported size.
        let overrun = shm_output(2).read_output("words", &region);
        let within = shm_output(1).read_output("words", &region);
        region.unlink().unwrap();

        assert!(matches!(overrun, Err(Error::ShapeMismatch(_))));
        assert_eq!(within.unwrap(), TensorData::Bytes(vec![b"ab".to_vec()]));
    }

    #[test]
    fn test_to_json_includes_data() {
        let mut tensor = output("text", "BYTES", vec![2]);
        tensor.contents = Some(
            to_contents(
                Datatype::Bytes,
                vec!["hello".to_string(), "world".to_string()].into(),
            )
            .unwrap(),
        );
        let response = ModelInferResponse {
            model_name: "echo".into(),
            id: "7".into(),
            outputs: vec![tensor],
            ..Default::default()
        };

        let json = InferResult::from_proto(response).unwrap().to_json().unwrap();
        assert_eq!(json["model_name"], "echo");
        assert_eq!(json["id"], "7");
        assert_eq!(json["outputs"][0]["datatype"], "BYTES");
        assert_eq!(json["outputs"][0]["data"], json!(["hello", "world"]));
    }
}
