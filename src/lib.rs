/// Module `error` contains the error types used across the crate.
///
/// - `ModelError` - validation and processing errors raised while building or
///   evaluating layers
/// - `IoError` - file and JSON errors raised while persisting parameters
pub mod error;

pub use error::{IoError, ModelError};

/// Components for building recurrent neural network layers.
///
/// This module provides the building blocks for a peephole LSTM layer that is
/// parameterized through an explicit parameter store.
///
/// # Core Components
///
/// ## Parameter management
/// - **ParameterStore**: a registry mapping string names to owned tensors,
///   handing out stable `ParamId` handles. Layers capture handles at build
///   time and read current values on every pass, so optimizer updates applied
///   between passes are always reflected. Supports JSON save/load.
///
/// ## Initializers
/// - **orthogonal_init**: orthogonal weight initialization via reduced SVD,
///   reshaped to an arbitrary target shape
/// - **scaled_uniform_init**: uniform `[0, scale)` initialization used for the
///   LSTM projection matrices
///
/// ## Recurrent layers
/// - **PeepholeLstm**: an LSTM cell with peephole connections from the cell
///   state into the input/forget/output gates, a learnable initial state pair,
///   masking support for variable-length sequences, and truncated
///   backpropagation through time
/// - **Recurrence** / **scan**: the per-timestep transition as a trait, and a
///   sequence driver folding it left-to-right over a time-major input while
///   collecting the full cell/hidden trajectories
///
/// # Examples
/// ```rust
/// use ndarray::Array3;
/// use rustyrnn::neural_network::{ParameterStore, PeepholeLstm};
///
/// let mut store = ParameterStore::new();
/// let mut lstm = PeepholeLstm::new(&mut store, "enc", 4, 6, -1).unwrap();
///
/// // Time-major input: 5 timesteps, batch of 3, 4 features
/// let x = Array3::<f32>::ones((5, 3, 4));
/// let (cell_seq, hidden_seq) = lstm.forward(&store, x.view()).unwrap();
/// assert_eq!(cell_seq.shape(), &[5, 3, 6]);
/// assert_eq!(hidden_seq.shape(), &[5, 3, 6]);
/// ```
pub mod neural_network;
