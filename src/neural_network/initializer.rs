use super::*;
use ndarray::{Array2, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

/// Which orthonormal SVD factor matches a requested flattened shape.
///
/// The reduced SVD of an `(rows, cols)` matrix yields `U` with shape
/// `(rows, k)` and `Vᵀ` with shape `(k, cols)` where `k = min(rows, cols)`.
/// Exactly one of them has the requested `(rows, cols)` shape unless the
/// target is square, in which case both do and `U` is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrthogonalFactor {
    LeftU,
    RightVt,
}

/// Selects the orthonormal factor whose shape equals the flattened target.
///
/// This is an explicit shape comparison, never a silent fallback: if neither
/// factor matches, the target shape is degenerate and an error is returned.
pub(crate) fn select_orthogonal_factor(
    u_shape: (usize, usize),
    v_t_shape: (usize, usize),
    target: (usize, usize),
) -> Result<OrthogonalFactor, ModelError> {
    if u_shape == target {
        Ok(OrthogonalFactor::LeftU)
    } else if v_t_shape == target {
        Ok(OrthogonalFactor::RightVt)
    } else {
        Err(ModelError::ProcessingError(format!(
            "no orthonormal SVD factor matches the flattened target shape {:?} (U: {:?}, V^T: {:?})",
            target, u_shape, v_t_shape
        )))
    }
}

/// Produces an orthogonally initialized tensor of the given shape.
///
/// The target shape `(d0, d1, ..., dk)` is flattened to `(d0, d1*...*dk)`.
/// A matrix of that shape is drawn with independent standard-normal entries,
/// its reduced singular value decomposition is computed, and whichever
/// orthonormal factor (`U` or `Vᵀ`) matches the flattened shape is reshaped
/// to the target. The flattened result `R` therefore satisfies `R·Rᵀ ≈ I`
/// (wide or square targets) or `Rᵀ·R ≈ I` (tall targets).
///
/// The draw uses the thread-local RNG; callers control reproducibility
/// externally.
///
/// # Parameters
///
/// - `shape` - Target tensor shape, at least two dimensions, all nonzero
///
/// # Returns
///
/// - `Ok(Tensor)` - Orthogonally initialized tensor with exactly the target shape
/// - `Err(ModelError::InputValidationError)` - If the shape has fewer than two dimensions or a zero dimension
/// - `Err(ModelError::ProcessingError)` - If the decomposition fails or no factor matches
///
/// # Example
/// ```rust
/// use rustyrnn::neural_network::initializer::orthogonal_init;
///
/// let w = orthogonal_init(&[6, 2, 3]).unwrap();
/// assert_eq!(w.shape(), &[6, 2, 3]);
/// ```
pub fn orthogonal_init(shape: &[usize]) -> Result<Tensor, ModelError> {
    if shape.len() < 2 {
        return Err(ModelError::InputValidationError(format!(
            "orthogonal initialization needs at least 2 dimensions, got {:?}",
            shape
        )));
    }
    if shape.contains(&0) {
        return Err(ModelError::InputValidationError(format!(
            "orthogonal initialization needs nonzero dimensions, got {:?}",
            shape
        )));
    }

    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();

    let mut rng = rand::rng();
    let flat = nalgebra::DMatrix::<f32>::from_fn(rows, cols, |_, _| rng.sample(StandardNormal));

    // Reduced SVD, as in the thin decomposition used for PCA
    let svd = nalgebra::SVD::new(flat, true, true);
    let u = svd
        .u
        .ok_or_else(|| ModelError::ProcessingError("SVD did not compute U".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| ModelError::ProcessingError("SVD did not compute V^T".to_string()))?;

    let q = match select_orthogonal_factor(u.shape(), v_t.shape(), (rows, cols))? {
        OrthogonalFactor::LeftU => u,
        OrthogonalFactor::RightVt => v_t,
    };

    // nalgebra matrices are column-major; copy out row-major for ndarray
    let flat_rows = Array2::from_shape_fn((rows, cols), |(i, j)| q[(i, j)]);
    let data: Vec<f32> = flat_rows.iter().copied().collect();
    Tensor::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| ModelError::ProcessingError(format!("failed to reshape to target: {}", e)))
}

/// Produces a `(rows, cols)` matrix with entries drawn uniformly from `[0, scale)`.
///
/// # Parameters
///
/// - `rows` - Number of rows
/// - `cols` - Number of columns
/// - `scale` - Exclusive upper bound of the draw, must be positive and finite
///
/// # Returns
///
/// - `Ok(Array2<f32>)` - The initialized matrix
/// - `Err(ModelError::InputValidationError)` - If `scale` is not a positive finite number
pub fn scaled_uniform_init(
    rows: usize,
    cols: usize,
    scale: f32,
) -> Result<Array2<f32>, ModelError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(ModelError::InputValidationError(format!(
            "scale must be positive and finite, got {}",
            scale
        )));
    }
    let mut rng = rand::rng();
    Ok(Array2::from_shape_simple_fn((rows, cols), || {
        rng.random::<f32>() * scale
    }))
}
