use approx::assert_abs_diff_eq;
use ndarray::{Array2, Ix2};
use rustyrnn::ModelError;
use rustyrnn::neural_network::initializer::{orthogonal_init, scaled_uniform_init};

/// Checks that `m` is the identity matrix up to SVD round-off.
fn assert_identity(m: &Array2<f32>) {
    assert_eq!(m.nrows(), m.ncols());
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(m[[i, j]], expected, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_tall_matrix_has_orthonormal_columns() {
    let w = orthogonal_init(&[6, 3]).unwrap();
    let r = w.into_dimensionality::<Ix2>().unwrap();
    assert_eq!(r.dim(), (6, 3));
    assert_identity(&r.t().dot(&r));
}

#[test]
fn test_wide_matrix_has_orthonormal_rows() {
    let w = orthogonal_init(&[3, 6]).unwrap();
    let r = w.into_dimensionality::<Ix2>().unwrap();
    assert_eq!(r.dim(), (3, 6));
    assert_identity(&r.dot(&r.t()));
}

#[test]
fn test_square_matrix_is_orthogonal() {
    let w = orthogonal_init(&[4, 4]).unwrap();
    let r = w.into_dimensionality::<Ix2>().unwrap();
    assert_identity(&r.t().dot(&r));
    assert_identity(&r.dot(&r.t()));
}

#[test]
fn test_higher_rank_target_is_orthonormal_when_flattened() {
    let w = orthogonal_init(&[6, 2, 3]).unwrap();
    assert_eq!(w.shape(), &[6, 2, 3]);

    // Flatten trailing axes back to (6, 6) and check orthogonality there
    let r = w.to_shape((6, 6)).unwrap().to_owned();
    assert_identity(&r.t().dot(&r));
}

#[test]
fn test_draws_are_not_repeated() {
    let a = orthogonal_init(&[5, 5]).unwrap();
    let b = orthogonal_init(&[5, 5]).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_rejects_degenerate_shapes() {
    assert!(matches!(
        orthogonal_init(&[5]),
        Err(ModelError::InputValidationError(_))
    ));
    assert!(matches!(
        orthogonal_init(&[]),
        Err(ModelError::InputValidationError(_))
    ));
    assert!(matches!(
        orthogonal_init(&[0, 3]),
        Err(ModelError::InputValidationError(_))
    ));
    assert!(matches!(
        orthogonal_init(&[4, 0, 2]),
        Err(ModelError::InputValidationError(_))
    ));
}

#[test]
fn test_scaled_uniform_stays_in_range() {
    let w = scaled_uniform_init(8, 16, 0.1).unwrap();
    assert_eq!(w.dim(), (8, 16));
    for v in w.iter() {
        assert!(*v >= 0.0 && *v < 0.1, "entry out of range: {}", v);
    }
}

#[test]
fn test_scaled_uniform_rejects_bad_scale() {
    assert!(matches!(
        scaled_uniform_init(2, 2, 0.0),
        Err(ModelError::InputValidationError(_))
    ));
    assert!(matches!(
        scaled_uniform_init(2, 2, -1.0),
        Err(ModelError::InputValidationError(_))
    ));
    assert!(matches!(
        scaled_uniform_init(2, 2, f32::NAN),
        Err(ModelError::InputValidationError(_))
    ));
}
