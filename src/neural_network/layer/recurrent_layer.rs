use super::*;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

/// Applies stable sigmoid activation to an array
///
/// Uses clipping to prevent numerical overflow before computing sigmoid.
#[inline]
pub(crate) fn apply_sigmoid(arr: Array2<f32>) -> Array2<f32> {
    arr.mapv(|x| {
        let clipped_x = x.clamp(-500.0, 500.0);
        1.0 / (1.0 + (-clipped_x).exp())
    })
}

/// Applies stable tanh activation to an array
#[inline]
pub(crate) fn apply_tanh(arr: Array2<f32>) -> Array2<f32> {
    arr.mapv(|x| {
        let clipped_x = x.clamp(-500.0, 500.0);
        clipped_x.tanh()
    })
}

/// Validates that a dimension value is greater than 0
///
/// # Parameters
///
/// - `value` - The dimension value to validate
/// - `name` - The name of the dimension for error messages
///
/// # Returns
///
/// * `Ok(())` if validation passes
/// * `Err(ModelError)` if validation fails
pub(super) fn validate_dimension_greater_than_zero(
    value: usize,
    name: &str,
) -> Result<(), ModelError> {
    if value == 0 {
        return Err(ModelError::InputValidationError(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}

/// Validates that two dimension values agree
///
/// Used to fail fast with a shape-mismatch error before a matrix multiply
/// would panic on incompatible operands.
#[inline]
pub(super) fn validate_dimensions_match(
    actual: usize,
    expected: usize,
    name: &str,
) -> Result<(), ModelError> {
    if actual != expected {
        return Err(ModelError::InputValidationError(format!(
            "{} has size {} but the layer expects {}",
            name, actual, expected
        )));
    }
    Ok(())
}

/// The per-timestep transition of a recurrent layer.
///
/// A recurrence maps the current input batch and the previous cell/hidden
/// state batches to the new cell/hidden state batches, reading its weights
/// from the parameter store. Implementations must be pure: the same inputs
/// and the same store contents always produce the same outputs.
///
/// The optional mask marks which batch rows carry a real timestep. Rows where
/// the mask is `false` are pass-throughs: the previous cell and hidden state
/// are returned unchanged for that example.
pub trait Recurrence {
    /// Number of hidden units produced per example.
    fn hidden_size(&self) -> usize;

    /// Computes one timestep.
    ///
    /// # Parameters
    ///
    /// - `store` - Parameter store holding the layer weights
    /// - `x` - Input batch with shape (batch, input_size)
    /// - `prev_cell` - Previous cell state with shape (batch, hidden_size)
    /// - `prev_hid` - Previous hidden state with shape (batch, hidden_size)
    /// - `mask` - Optional per-example validity mask with shape (batch,)
    ///
    /// # Returns
    ///
    /// - `Ok((cell, hid))` - New cell and hidden state batches, each (batch, hidden_size)
    /// - `Err(ModelError::InputValidationError)` - If any operand shape disagrees with the layer dimensions
    fn step(
        &self,
        store: &ParameterStore,
        x: ArrayView2<f32>,
        prev_cell: ArrayView2<f32>,
        prev_hid: ArrayView2<f32>,
        mask: Option<ArrayView1<bool>>,
    ) -> Result<(Array2<f32>, Array2<f32>), ModelError>;
}

/// Drives a recurrence left-to-right over a time-major input sequence.
///
/// The fold carries two accumulators (cell state, hidden state) and collects
/// every intermediate pair, so the full trajectories are returned rather than
/// only the final states. Timesteps are strictly sequential; batch-dimension
/// parallelism happens inside the step's matrix operations.
///
/// # Parameters
///
/// - `recurrence` - The per-timestep transition
/// - `store` - Parameter store holding the layer weights
/// - `input` - Time-major input with shape (timesteps, batch, input_size)
/// - `mask` - Optional validity mask with shape (timesteps, batch)
/// - `init_cell` - Initial cell state broadcast over the batch, shape (batch, hidden_size)
/// - `init_hidden` - Initial hidden state broadcast over the batch, shape (batch, hidden_size)
///
/// # Returns
///
/// - `Ok((cell_seq, hidden_seq))` - Full state trajectories, each with shape (timesteps, batch, hidden_size)
/// - `Err(ModelError)` - If the mask or state shapes disagree with the input
pub fn scan<R: Recurrence>(
    recurrence: &R,
    store: &ParameterStore,
    input: ArrayView3<f32>,
    mask: Option<ArrayView2<bool>>,
    init_cell: Array2<f32>,
    init_hidden: Array2<f32>,
) -> Result<(Array3<f32>, Array3<f32>), ModelError> {
    let (timesteps, batch) = (input.shape()[0], input.shape()[1]);
    let hidden_size = recurrence.hidden_size();

    if let Some(m) = mask {
        if m.shape() != [timesteps, batch] {
            return Err(ModelError::InputValidationError(format!(
                "mask shape {:?} does not match (timesteps, batch) = ({}, {})",
                m.shape(),
                timesteps,
                batch
            )));
        }
    }
    validate_dimensions_match(init_cell.nrows(), batch, "init_cell batch axis")?;
    validate_dimensions_match(init_hidden.nrows(), batch, "init_hidden batch axis")?;

    let mut cell_seq = Array3::<f32>::zeros((timesteps, batch, hidden_size));
    let mut hidden_seq = Array3::<f32>::zeros((timesteps, batch, hidden_size));

    let mut cell = init_cell;
    let mut hid = init_hidden;
    for t in 0..timesteps {
        let x_t = input.index_axis(Axis(0), t);
        let mask_t = mask.map(|m| m.index_axis_move(Axis(0), t));
        let (new_cell, new_hid) = recurrence.step(store, x_t, cell.view(), hid.view(), mask_t)?;
        cell_seq.index_axis_mut(Axis(0), t).assign(&new_cell);
        hidden_seq.index_axis_mut(Axis(0), t).assign(&new_hid);
        cell = new_cell;
        hid = new_hid;
    }

    Ok((cell_seq, hidden_seq))
}

/// A peephole LSTM layer implementation
pub mod peephole_lstm;

pub use peephole_lstm::PeepholeLstm;
