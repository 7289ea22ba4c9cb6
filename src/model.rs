use std::{path::Path, sync::Arc};

use ndarray::{Array4, ArrayD, Axis, IxDyn};
use tensorflow::{
    DataType, Graph, ImportGraphDefOptions, Output, Session, SessionOptions, SessionRunArgs, Shape,
    Tensor,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("failed to read model {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load graph: {0}")]
    Graph(String),

    #[error("operation {0:?} not found in graph")]
    MissingOperation(String),

    #[error("model output has {outputs} classes but {labels} class labels are configured")]
    LabelMismatch { outputs: i64, labels: usize },
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model is not loaded")]
    ModelUnavailable,

    #[error("input tensor shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<usize> },

    #[error("model produced {outputs} scores but {labels} class labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },

    #[error("model produced no scores")]
    EmptyOutput,

    #[error("inference failed: {0}")]
    Runtime(String),
}

impl InferenceError {
    fn runtime(err: impl std::fmt::Display) -> Self {
        InferenceError::Runtime(err.to_string())
    }
}

/// Shapes and dtypes of the sole input and output slot. Unknown dimensions
/// are reported as `-1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub input_shape: Vec<i64>,
    pub output_shape: Vec<i64>,
    pub input_dtype: String,
    pub output_dtype: String,
}

impl ModelMetadata {
    /// Fails when the output's class dimension is known and disagrees with
    /// the configured label count.
    pub fn check_label_count(&self, labels: usize) -> Result<(), ModelLoadError> {
        match self.output_shape.last() {
            Some(&outputs) if outputs >= 0 && outputs as usize != labels => {
                Err(ModelLoadError::LabelMismatch { outputs, labels })
            }
            _ => Ok(()),
        }
    }
}

/// A loaded model that can run one forward pass.
pub trait InferenceBackend: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;

    /// Runs the model and returns the raw output tensor, batch axis included.
    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, InferenceError>;
}

/// Frozen TensorFlow graph with named input and output operations.
pub struct TensorflowModel {
    session: Session,
    graph: Graph,
    input_op: String,
    output_op: String,
    metadata: ModelMetadata,
}

impl TensorflowModel {
    pub fn load(model_path: &Path, input_op: &str, output_op: &str) -> Result<Self, ModelLoadError> {
        let model_bytes = std::fs::read(model_path).map_err(|source| ModelLoadError::Read {
            path: model_path.display().to_string(),
            source,
        })?;

        let mut graph = Graph::new();
        graph
            .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
            .map_err(|e| ModelLoadError::Graph(e.to_string()))?;

        let session = Session::new(&SessionOptions::new(), &graph)
            .map_err(|e| ModelLoadError::Graph(e.to_string()))?;

        let (input_shape, input_dtype) = describe_output(&graph, input_op)?;
        let (output_shape, output_dtype) = describe_output(&graph, output_op)?;
        debug!(?input_shape, ?output_shape, "imported graph");

        Ok(TensorflowModel {
            session,
            graph,
            input_op: input_op.to_string(),
            output_op: output_op.to_string(),
            metadata: ModelMetadata {
                input_shape,
                output_shape,
                input_dtype,
                output_dtype,
            },
        })
    }
}

fn describe_output(graph: &Graph, op_name: &str) -> Result<(Vec<i64>, String), ModelLoadError> {
    let operation = graph
        .operation_by_name(op_name)
        .map_err(|e| ModelLoadError::Graph(e.to_string()))?
        .ok_or_else(|| ModelLoadError::MissingOperation(op_name.to_string()))?;
    let dtype = dtype_name(operation.output_type(0));
    let shape = graph
        .tensor_shape(Output {
            operation,
            index: 0,
        })
        .map_err(|e| ModelLoadError::Graph(e.to_string()))?;
    Ok((shape_dims(&shape), dtype))
}

fn shape_dims(shape: &Shape) -> Vec<i64> {
    match shape.dims() {
        Some(rank) => (0..rank).map(|i| shape[i].unwrap_or(-1)).collect(),
        None => Vec::new(),
    }
}

fn dtype_name(dtype: DataType) -> String {
    let name = match dtype {
        DataType::Float => "float32",
        DataType::Double => "float64",
        DataType::Half => "float16",
        DataType::BFloat16 => "bfloat16",
        DataType::Int8 => "int8",
        DataType::Int16 => "int16",
        DataType::Int32 => "int32",
        DataType::Int64 => "int64",
        DataType::UInt8 => "uint8",
        DataType::UInt16 => "uint16",
        DataType::Bool => "bool",
        DataType::String => "string",
        other => return format!("{other:?}").to_lowercase(),
    };
    name.to_string()
}

impl InferenceBackend for TensorflowModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let dims: Vec<u64> = input.shape().iter().map(|&d| d as u64).collect();
        let values = input
            .as_slice()
            .ok_or_else(|| InferenceError::runtime("input tensor is not contiguous"))?;
        let input_tensor = Tensor::<f32>::new(&dims)
            .with_values(values)
            .map_err(InferenceError::runtime)?;

        let input_operation = self
            .graph
            .operation_by_name_required(&self.input_op)
            .map_err(InferenceError::runtime)?;
        let output_operation = self
            .graph
            .operation_by_name_required(&self.output_op)
            .map_err(InferenceError::runtime)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args).map_err(InferenceError::runtime)?;

        let output_tensor: Tensor<f32> = args.fetch(output_token).map_err(InferenceError::runtime)?;
        let out_dims: Vec<usize> = output_tensor.dims().iter().map(|&d| d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&out_dims), output_tensor.to_vec())
            .map_err(InferenceError::runtime)
    }
}

/// Runs single-image inference against the loaded model, or reports the
/// model as unavailable when loading failed at startup.
#[derive(Clone)]
pub struct InferenceEngine {
    backend: Option<Arc<dyn InferenceBackend>>,
}

impl InferenceEngine {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    pub fn metadata(&self) -> Result<&ModelMetadata, InferenceError> {
        self.backend
            .as_deref()
            .map(|b| b.metadata())
            .ok_or(InferenceError::ModelUnavailable)
    }

    /// Returns the per-class scores with the batch axis removed.
    pub fn infer(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let backend = self
            .backend
            .as_deref()
            .ok_or(InferenceError::ModelUnavailable)?;

        check_input_shape(&backend.metadata().input_shape, input.shape())?;
        let output = backend.run(input)?;
        strip_batch(output)
    }
}

fn check_input_shape(expected: &[i64], actual: &[usize]) -> Result<(), InferenceError> {
    if expected.is_empty() {
        return Ok(());
    }
    let matches = expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(&e, &a)| e < 0 || e as usize == a);
    if matches {
        Ok(())
    } else {
        Err(InferenceError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

fn strip_batch(output: ArrayD<f32>) -> Result<Vec<f32>, InferenceError> {
    let scores: Vec<f32> = match output.ndim() {
        0 => return Err(InferenceError::EmptyOutput),
        1 => output.iter().copied().collect(),
        _ if output.shape()[0] == 1 => output.index_axis(Axis(0), 0).iter().copied().collect(),
        _ => {
            return Err(InferenceError::Runtime(format!(
                "expected a batch of one, got output shape {:?}",
                output.shape()
            )))
        }
    };
    if scores.is_empty() {
        return Err(InferenceError::EmptyOutput);
    }
    Ok(scores)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Backend that returns fixed scores with shape `[1, n]`.
    pub struct StaticBackend {
        pub metadata: ModelMetadata,
        pub scores: Vec<f32>,
        pub calls: AtomicUsize,
    }

    impl StaticBackend {
        pub fn new(input: (u32, u32), scores: Vec<f32>) -> Self {
            Self {
                metadata: ModelMetadata {
                    input_shape: vec![1, input.1 as i64, input.0 as i64, 3],
                    output_shape: vec![1, scores.len() as i64],
                    input_dtype: "float32".into(),
                    output_dtype: "float32".into(),
                },
                scores,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl InferenceBackend for StaticBackend {
        fn metadata(&self) -> &ModelMetadata {
            &self.metadata
        }

        fn run(&self, _input: &Array4<f32>) -> Result<ArrayD<f32>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ArrayD::from_shape_vec(IxDyn(&[1, self.scores.len()]), self.scores.clone())
                .map_err(InferenceError::runtime)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use ndarray::arr2;

    use super::testing::StaticBackend;
    use super::*;

    #[test]
    fn unavailable_engine_refuses_every_call() {
        let engine = InferenceEngine::unavailable();
        assert!(!engine.is_loaded());
        assert!(matches!(
            engine.metadata(),
            Err(InferenceError::ModelUnavailable)
        ));
        let input = Array4::<f32>::zeros((1, 2, 2, 3));
        assert!(matches!(
            engine.infer(&input),
            Err(InferenceError::ModelUnavailable)
        ));
    }

    #[test]
    fn infer_strips_batch_dimension() {
        let backend = Arc::new(StaticBackend::new((2, 2), vec![0.1, 0.7, 0.2]));
        let engine = InferenceEngine::new(backend.clone());
        let scores = engine.infer(&Array4::zeros((1, 2, 2, 3))).unwrap();
        assert_eq!(scores, vec![0.1, 0.7, 0.2]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrong_input_shape_is_rejected_before_running() {
        let backend = Arc::new(StaticBackend::new((4, 4), vec![1.0]));
        let engine = InferenceEngine::new(backend.clone());
        let err = engine.infer(&Array4::zeros((1, 2, 2, 3))).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_dimensions_accept_any_size() {
        assert!(check_input_shape(&[-1, -1, -1, 3], &[1, 224, 224, 3]).is_ok());
        assert!(check_input_shape(&[], &[1, 5, 5, 3]).is_ok());
        assert!(check_input_shape(&[-1, 224, 224, 3], &[1, 224, 224, 1]).is_err());
    }

    #[test]
    fn batches_larger_than_one_are_rejected() {
        let output = arr2(&[[0.5f32, 0.5], [0.2, 0.8]]).into_dyn();
        assert!(matches!(strip_batch(output), Err(InferenceError::Runtime(_))));

        let empty = ArrayD::<f32>::zeros(IxDyn(&[1, 0]));
        assert!(matches!(strip_batch(empty), Err(InferenceError::EmptyOutput)));
    }

    #[test]
    fn label_count_is_checked_against_known_output_dim() {
        let metadata = StaticBackend::new((2, 2), vec![0.0; 4]).metadata;
        assert!(metadata.check_label_count(4).is_ok());
        assert!(matches!(
            metadata.check_label_count(3),
            Err(ModelLoadError::LabelMismatch { outputs: 4, labels: 3 })
        ));

        let unknown = ModelMetadata {
            output_shape: vec![-1, -1],
            ..metadata
        };
        assert!(unknown.check_label_count(3).is_ok());
    }

    #[test]
    fn dtype_names_follow_numpy_spelling() {
        assert_eq!(dtype_name(DataType::Float), "float32");
        assert_eq!(dtype_name(DataType::UInt8), "uint8");
    }
}
