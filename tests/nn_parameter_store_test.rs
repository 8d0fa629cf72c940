use ndarray::{Array, Array1, Array2};
use rustyrnn::ModelError;
use rustyrnn::neural_network::ParameterStore;

#[test]
fn test_register_and_lookup() {
    let mut store = ParameterStore::new();
    assert!(store.is_empty());

    let a = store.register("W_enc_input", Array2::<f32>::zeros((3, 8)).into_dyn());
    let b = store.register("b_enc", Array2::<f32>::ones((4, 2)).into_dyn());

    assert_eq!(store.len(), 2);
    assert_ne!(a, b);
    assert_eq!(store.id("W_enc_input"), Some(a));
    assert_eq!(store.id("b_enc"), Some(b));
    assert_eq!(store.id("missing"), None);
    assert_eq!(store.name(a), "W_enc_input");
    assert_eq!(store.get(a).shape(), &[3, 8]);
    assert_eq!(store.get(b).shape(), &[4, 2]);
}

#[test]
fn test_overwrite_keeps_handles_stable() {
    let mut store = ParameterStore::new();
    let id = store.register("b_enc", Array2::<f32>::zeros((4, 2)).into_dyn());

    // Re-registering the same name replaces the value in place
    let id_again = store.register("b_enc", Array2::<f32>::ones((4, 2)).into_dyn());
    assert_eq!(id, id_again);
    assert_eq!(store.len(), 1);
    assert!(store.get(id).iter().all(|v| *v == 1.0));
}

#[test]
fn test_typed_views_enforce_rank() {
    let mut store = ParameterStore::new();
    let vec_id = store.register("init_enc_cell", Array1::<f32>::zeros(6).into_dyn());
    let mat_id = store.register("W_enc_hidden", Array2::<f32>::zeros((6, 24)).into_dyn());

    assert_eq!(store.get1(vec_id).unwrap().len(), 6);
    assert_eq!(store.get2(mat_id).unwrap().dim(), (6, 24));

    assert!(matches!(
        store.get2(vec_id),
        Err(ModelError::ProcessingError(_))
    ));
    assert!(matches!(
        store.get1(mat_id),
        Err(ModelError::ProcessingError(_))
    ));
    assert!(matches!(
        store.get1_mut(mat_id),
        Err(ModelError::ProcessingError(_))
    ));
    assert!(matches!(
        store.get2_mut(vec_id),
        Err(ModelError::ProcessingError(_))
    ));
}

#[test]
fn test_mutation_through_handle() {
    let mut store = ParameterStore::new();
    let id = store.register("b_enc", Array2::<f32>::zeros((2, 3)).into_dyn());

    {
        let mut bias = store.get2_mut(id).unwrap();
        bias[[1, 2]] = 2.5;
    }
    assert_eq!(store.get(id)[[1usize, 2]], 2.5);
}

#[test]
fn test_iter_follows_registration_order() {
    let mut store = ParameterStore::new();
    store.register("W_enc_input", Array2::<f32>::zeros((2, 8)).into_dyn());
    store.register("W_enc_hidden", Array2::<f32>::zeros((2, 8)).into_dyn());
    store.register("b_enc", Array2::<f32>::zeros((4, 2)).into_dyn());

    let names: Vec<&str> = store.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["W_enc_input", "W_enc_hidden", "b_enc"]);
}

#[test]
fn test_save_load_round_trip() {
    let mut store = ParameterStore::new();
    let w = store.register(
        "W_enc_input",
        Array::from_shape_fn((3, 4), |(i, j)| i as f32 + 0.25 * j as f32).into_dyn(),
    );
    let init = store.register(
        "init_enc_cell",
        Array::from_shape_fn(5, |i| -(i as f32)).into_dyn(),
    );

    let path = std::env::temp_dir().join("rustyrnn_store_round_trip.json");
    let path = path.to_str().unwrap();
    store.save(path).unwrap();

    let loaded = ParameterStore::load(path).unwrap();
    std::fs::remove_file(path).ok();

    assert_eq!(loaded.len(), 2);
    // Registration order is preserved, so the handles line up
    assert_eq!(loaded.id("W_enc_input"), Some(w));
    assert_eq!(loaded.id("init_enc_cell"), Some(init));
    assert_eq!(loaded.get(w), store.get(w));
    assert_eq!(loaded.get(init), store.get(init));
}

#[test]
fn test_load_missing_file_is_an_error() {
    let path = std::env::temp_dir().join("rustyrnn_store_does_not_exist.json");
    assert!(ParameterStore::load(path.to_str().unwrap()).is_err());
}
