/// Module that contains weight initialization routines
pub mod initializer;
/// Module that contains neural network layer implementations
pub mod layer;
/// Module that contains the named parameter registry
pub mod parameters;

pub use initializer::*;
pub use layer::*;
pub use parameters::*;

use crate::ModelError;
use ndarray::ArrayD;

/// Type alias for n-dimensional arrays used as tensors in the neural network
pub type Tensor = ArrayD<f32>;
