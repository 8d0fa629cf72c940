use super::*;
use crate::error::IoError;
use ahash::AHashMap;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, IxDyn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;

/// Stable handle to a parameter slot inside a [`ParameterStore`].
///
/// Handles are plain slot indices. They are handed out at registration time
/// and stay valid for the lifetime of the store: overwriting a name with a
/// new value reuses the existing slot, so layers that captured the handle
/// keep observing the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

/// A registry of named, mutable parameter tensors.
///
/// Layers register their learnable weights here under deterministic,
/// name-prefixed keys and capture [`ParamId`] handles instead of looking the
/// tensors up by string on every access. Reads during a forward or backward
/// pass always see the current slot contents, so an optimizer mutating the
/// store through [`ParameterStore::get_mut`] between passes is reflected on
/// the next evaluation.
///
/// # Fields
///
/// - `ids` - Name to slot-handle index
/// - `names` - Slot index to name, in registration order
/// - `values` - Owned parameter tensors, one per slot
///
/// # Example
/// ```rust
/// use ndarray::Array;
/// use rustyrnn::neural_network::ParameterStore;
///
/// let mut store = ParameterStore::new();
/// let id = store.register("b_layer", Array::zeros((4, 6)).into_dyn());
/// assert_eq!(store.get(id).shape(), &[4, 6]);
/// assert_eq!(store.id("b_layer"), Some(id));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    ids: AHashMap<String, ParamId>,
    names: Vec<String>,
    values: Vec<Tensor>,
}

/// Serializable representation of one parameter slot.
///
/// # Fields
///
/// - `name` - Registered parameter name
/// - `shape` - Tensor shape
/// - `data` - Tensor contents in row-major order
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializableParameter {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl ParameterStore {
    /// Creates an empty parameter store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter under `name`, returning its stable handle.
    ///
    /// If the name is already registered, the existing slot is overwritten in
    /// place and the original handle is returned, so previously captured
    /// handles remain valid.
    ///
    /// # Parameters
    ///
    /// - `name` - Key the parameter is registered under
    /// - `value` - Initial tensor value
    ///
    /// # Returns
    ///
    /// * `ParamId` - Stable handle to the parameter slot
    pub fn register(&mut self, name: &str, value: Tensor) -> ParamId {
        if let Some(&id) = self.ids.get(name) {
            self.values[id.0] = value;
            return id;
        }
        let id = ParamId(self.values.len());
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.values.push(value);
        id
    }

    /// Looks up the handle registered under `name`, if any.
    pub fn id(&self, name: &str) -> Option<ParamId> {
        self.ids.get(name).copied()
    }

    /// Returns the name a handle was registered under.
    pub fn name(&self, id: ParamId) -> &str {
        &self.names[id.0]
    }

    /// Returns the current value of a parameter.
    pub fn get(&self, id: ParamId) -> &Tensor {
        &self.values[id.0]
    }

    /// Returns a mutable reference to a parameter, for optimizer updates.
    pub fn get_mut(&mut self, id: ParamId) -> &mut Tensor {
        &mut self.values[id.0]
    }

    /// Views a parameter as a 1-D array.
    ///
    /// # Returns
    ///
    /// - `Ok(ArrayView1<f32>)` - The parameter viewed with fixed rank
    /// - `Err(ModelError::ProcessingError)` - If the stored tensor is not 1-D
    pub fn get1(&self, id: ParamId) -> Result<ArrayView1<'_, f32>, ModelError> {
        self.values[id.0]
            .view()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|_| self.rank_error(id, 1))
    }

    /// Views a parameter as a 2-D array.
    ///
    /// # Returns
    ///
    /// - `Ok(ArrayView2<f32>)` - The parameter viewed with fixed rank
    /// - `Err(ModelError::ProcessingError)` - If the stored tensor is not 2-D
    pub fn get2(&self, id: ParamId) -> Result<ArrayView2<'_, f32>, ModelError> {
        self.values[id.0]
            .view()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|_| self.rank_error(id, 2))
    }

    /// Mutably views a parameter as a 1-D array.
    pub fn get1_mut(&mut self, id: ParamId) -> Result<ArrayViewMut1<'_, f32>, ModelError> {
        let err = self.rank_error(id, 1);
        self.values[id.0]
            .view_mut()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|_| err)
    }

    /// Mutably views a parameter as a 2-D array.
    pub fn get2_mut(&mut self, id: ParamId) -> Result<ArrayViewMut2<'_, f32>, ModelError> {
        let err = self.rank_error(id, 2);
        self.values[id.0]
            .view_mut()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|_| err)
    }

    fn rank_error(&self, id: ParamId, rank: usize) -> ModelError {
        ModelError::ProcessingError(format!(
            "parameter '{}' has shape {:?}, expected a {}-D tensor",
            self.names[id.0],
            self.values[id.0].shape(),
            rank
        ))
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(name, tensor)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Saves all parameters to a JSON file.
    ///
    /// Parameters are written in registration order so that a subsequent
    /// [`ParameterStore::load`] hands out the same `ParamId` for each name.
    ///
    /// # Parameters
    ///
    /// - `path` - Destination file path
    ///
    /// # Returns
    ///
    /// - `Ok(())` - All parameters were written
    /// - `Err(IoError)` - On file creation or JSON serialization failure
    pub fn save(&self, path: &str) -> Result<(), IoError> {
        let records: Vec<SerializableParameter> = self
            .iter()
            .map(|(name, value)| SerializableParameter {
                name: name.to_string(),
                shape: value.shape().to_vec(),
                data: value.iter().copied().collect(),
            })
            .collect();

        let file = File::create(path).map_err(IoError::StdIoError)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &records).map_err(IoError::JsonError)
    }

    /// Loads a parameter store from a JSON file written by [`ParameterStore::save`].
    ///
    /// # Parameters
    ///
    /// - `path` - Source file path
    ///
    /// # Returns
    ///
    /// - `Ok(ParameterStore)` - A store with the recorded parameters registered in file order
    /// - `Err(IoError)` - On file access, JSON parsing, or shape/data length mismatch
    pub fn load(path: &str) -> Result<Self, IoError> {
        let reader = IoError::load_in_buf_reader(path)?;
        let records: Vec<SerializableParameter> =
            serde_json::from_reader(reader).map_err(IoError::JsonError)?;

        let mut store = Self::new();
        for record in records {
            let tensor = Tensor::from_shape_vec(IxDyn(&record.shape), record.data)
                .map_err(|e| IoError::StdIoError(std::io::Error::other(e.to_string())))?;
            store.register(&record.name, tensor);
        }
        Ok(store)
    }
}
