use super::*;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, concatenate, s};

/// Threshold for using parallel computation in the peephole LSTM layer.
/// When batch_size * hidden_size < this value, sequential execution is used.
/// When batch_size * hidden_size >= this value, parallel execution is used.
///
/// Value is chosen based on empirical benchmarks where rayon's thread pool
/// overhead is amortized by computational gains from parallelization.
const PEEPHOLE_LSTM_PARALLEL_THRESHOLD: usize = 1024;

/// Gradient clipping value applied by `sgd_update` to prevent exploding gradients
const GRADIENT_CLIP_VALUE: f32 = 5.0;

/// Initial value of the forget-gate bias row.
///
/// A strongly positive forget bias keeps the cell state open early in
/// training so long-range dependencies can form before the gate learns to
/// discard information.
const FORGET_BIAS_INIT: f32 = 2.5;

/// Scale of the uniform `[0, scale)` draw used for the projection matrices
const WEIGHT_INIT_SCALE: f32 = 0.1;

/// Cached values from the forward pass needed for backpropagation through time.
///
/// Gate activations are not cached; the backward pass recomputes them per
/// timestep from the cached inputs and state trajectories.
struct ForwardCache {
    /// Input sequence, shape (timesteps, batch, input_size)
    input: Array3<f32>,
    /// Validity mask threaded through the scan, if any, shape (timesteps, batch)
    mask: Option<Array2<bool>>,
    /// Batch-broadcast initial cell state, shape (batch, hidden_size)
    init_cell: Array2<f32>,
    /// Batch-broadcast initial hidden state (post-tanh), shape (batch, hidden_size)
    init_hidden: Array2<f32>,
    /// Cell state trajectory, shape (timesteps, batch, hidden_size)
    cell_seq: Array3<f32>,
    /// Hidden state trajectory, shape (timesteps, batch, hidden_size)
    hidden_seq: Array3<f32>,
}

/// Gradients of all learnable parameters of a [`PeepholeLstm`] layer.
///
/// Produced by [`PeepholeLstm::backward`] and consumed by an optimizer (or by
/// [`PeepholeLstm::sgd_update`]) to mutate the parameter store.
///
/// # Fields
///
/// - `w_input` - Gradient for the input projection, shape (input_size, 4·hidden_size)
/// - `w_hidden` - Gradient for the hidden projection, shape (hidden_size, 4·hidden_size)
/// - `w_cell` - Gradient for the peephole projections, shape (hidden_size, 3·hidden_size)
/// - `bias` - Gradient for the per-gate biases, shape (4, hidden_size)
/// - `init_hidden` - Gradient for the learnable pre-tanh initial hidden state, shape (hidden_size,)
/// - `init_cell` - Gradient for the learnable initial cell state, shape (hidden_size,)
#[derive(Debug, Clone)]
pub struct PeepholeLstmGradients {
    pub w_input: Array2<f32>,
    pub w_hidden: Array2<f32>,
    pub w_cell: Array2<f32>,
    pub bias: Array2<f32>,
    pub init_hidden: Array1<f32>,
    pub init_cell: Array1<f32>,
}

/// Long Short-Term Memory layer with peephole connections.
///
/// This is a standard LSTM cell with one architectural deviation: direct
/// linear paths from the cell state into the gate pre-activations. The
/// previous cell state feeds the input and forget gates, and the freshly
/// updated cell state feeds the output gate. There is no clipping, dropout,
/// or normalization; the gate computation is otherwise literal.
///
/// # Mathematical Operations
///
/// For each timestep t (σ is sigmoid, ⊙ is element-wise multiplication):
/// 1. i_t = σ(x_t·W_i + h_{t-1}·U_i + b_i + c_{t-1}·V_i)  (input gate)
/// 2. f_t = σ(x_t·W_f + h_{t-1}·U_f + b_f + c_{t-1}·V_f)  (forget gate)
/// 3. g_t = tanh(x_t·W_c + h_{t-1}·U_c + b_c)  (cell candidate, no peephole)
/// 4. c_t = f_t ⊙ c_{t-1} + i_t ⊙ g_t  (cell state update)
/// 5. o_t = σ(x_t·W_o + h_{t-1}·U_o + b_o + c_t·V_o)  (output gate, new cell)
/// 6. h_t = o_t ⊙ tanh(c_t)  (hidden state update)
///
/// The W_* columns live side by side in one `[input_size, 4·hidden_size]`
/// matrix (gate order input, forget, cell, output), the U_* in one
/// `[hidden_size, 4·hidden_size]` matrix, and the peepholes V_i, V_f, V_o in
/// one `[hidden_size, 3·hidden_size]` matrix.
///
/// All parameters are registered in an external [`ParameterStore`] under keys
/// derived from the layer name, so multiple layers can share one store
/// without collision. The layer keeps only the stable handles and reads
/// current values on every pass.
///
/// When a validity mask is supplied, batch rows whose mask entry is `false`
/// freeze: the previous cell and hidden state pass through unchanged, so
/// padded timesteps of variable-length sequences have no effect on state.
///
/// # Parameter keys
///
/// For a layer named `N`: `W_<N>_input`, `W_<N>_hidden`, `W_<N>_cell`,
/// `b_<N>`, `init_<N>_hidden`, `init_<N>_cell`.
///
/// # Example
/// ```rust
/// use ndarray::Array3;
/// use rustyrnn::neural_network::{ParameterStore, PeepholeLstm};
///
/// let mut store = ParameterStore::new();
/// let mut lstm = PeepholeLstm::new(&mut store, "enc", 4, 6, -1).unwrap();
///
/// let x = Array3::<f32>::ones((5, 3, 4)); // (timesteps, batch, input_size)
/// let (cell_seq, hidden_seq) = lstm.forward(&store, x.view()).unwrap();
/// assert_eq!(cell_seq.shape(), &[5, 3, 6]);
/// assert_eq!(hidden_seq.shape(), &[5, 3, 6]);
///
/// // Backpropagate a loss gradient on the hidden trajectory
/// let grad = Array3::<f32>::ones((5, 3, 6));
/// let (grad_x, grads) = lstm.backward(&store, grad.view()).unwrap();
/// assert_eq!(grad_x.shape(), &[5, 3, 4]);
/// lstm.sgd_update(&mut store, &grads, 0.01).unwrap();
/// ```
pub struct PeepholeLstm {
    name: String,
    input_size: usize,
    hidden_size: usize,
    /// How many trailing timesteps the backward scan visits; -1 means all
    truncate_gradient: isize,

    w_input: ParamId,
    w_hidden: ParamId,
    w_cell: ParamId,
    bias: ParamId,
    init_hidden: ParamId,
    init_cell: ParamId,

    cache: Option<ForwardCache>,
}

impl PeepholeLstm {
    /// Creates a peephole LSTM layer and registers its parameters.
    ///
    /// Projection matrices are drawn uniformly from `[0, 0.1)`; the bias is a
    /// `[4, hidden_size]` matrix with the forget row at 2.5 and the others at
    /// zero; both learnable initial states start at zero. Registration
    /// overwrites any previous parameters under the same layer name.
    ///
    /// # Parameters
    ///
    /// - `store` - Parameter store the weights are registered in
    /// - `name` - Layer name, used to derive the parameter keys
    /// - `input_size` - Number of input features per timestep
    /// - `hidden_size` - Number of hidden units
    /// - `truncate_gradient` - Backpropagation horizon in timesteps; -1 propagates through the full sequence
    ///
    /// # Returns
    ///
    /// - `Ok(PeepholeLstm)` - The layer holding stable handles to its parameters
    /// - `Err(ModelError::InputValidationError)` - If a dimension is zero or the horizon is below -1
    pub fn new(
        store: &mut ParameterStore,
        name: &str,
        input_size: usize,
        hidden_size: usize,
        truncate_gradient: isize,
    ) -> Result<Self, ModelError> {
        validate_dimension_greater_than_zero(input_size, "input_size")?;
        validate_dimension_greater_than_zero(hidden_size, "hidden_size")?;
        if truncate_gradient < -1 {
            return Err(ModelError::InputValidationError(format!(
                "truncate_gradient must be -1 (unbounded) or non-negative, got {}",
                truncate_gradient
            )));
        }

        let w_input = store.register(
            &format!("W_{}_input", name),
            scaled_uniform_init(input_size, 4 * hidden_size, WEIGHT_INIT_SCALE)?.into_dyn(),
        );
        let w_hidden = store.register(
            &format!("W_{}_hidden", name),
            scaled_uniform_init(hidden_size, 4 * hidden_size, WEIGHT_INIT_SCALE)?.into_dyn(),
        );
        let w_cell = store.register(
            &format!("W_{}_cell", name),
            scaled_uniform_init(hidden_size, 3 * hidden_size, WEIGHT_INIT_SCALE)?.into_dyn(),
        );

        let mut bias_init = Array2::<f32>::zeros((4, hidden_size));
        bias_init.row_mut(1).fill(FORGET_BIAS_INIT);
        let bias = store.register(&format!("b_{}", name), bias_init.into_dyn());

        let init_hidden = store.register(
            &format!("init_{}_hidden", name),
            Array1::<f32>::zeros(hidden_size).into_dyn(),
        );
        let init_cell = store.register(
            &format!("init_{}_cell", name),
            Array1::<f32>::zeros(hidden_size).into_dyn(),
        );

        Ok(Self {
            name: name.to_string(),
            input_size,
            hidden_size,
            truncate_gradient,
            w_input,
            w_hidden,
            w_cell,
            bias,
            init_hidden,
            init_cell,
            cache: None,
        })
    }

    /// Returns the layer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of input features per timestep
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Returns the number of hidden units
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Returns the backpropagation horizon (-1 means unbounded)
    pub fn truncate_gradient(&self) -> isize {
        self.truncate_gradient
    }

    /// Returns the handles of all six parameters in registration order:
    /// input projection, hidden projection, peephole projections, bias,
    /// initial hidden state, initial cell state.
    pub fn param_ids(&self) -> [ParamId; 6] {
        [
            self.w_input,
            self.w_hidden,
            self.w_cell,
            self.bias,
            self.init_hidden,
            self.init_cell,
        ]
    }

    /// Total number of trainable scalars in the layer
    pub fn param_count(&self) -> usize {
        let (i, h) = (self.input_size, self.hidden_size);
        i * 4 * h + h * 4 * h + h * 3 * h + 4 * h + 2 * h
    }

    fn validate_step_shapes(
        &self,
        x: &ArrayView2<f32>,
        prev_cell: &ArrayView2<f32>,
        prev_hid: &ArrayView2<f32>,
        mask: &Option<ArrayView1<bool>>,
    ) -> Result<(), ModelError> {
        let batch = x.nrows();
        validate_dimensions_match(x.ncols(), self.input_size, "input feature axis")?;
        validate_dimensions_match(prev_cell.ncols(), self.hidden_size, "prev_cell hidden axis")?;
        validate_dimensions_match(prev_hid.ncols(), self.hidden_size, "prev_hid hidden axis")?;
        validate_dimensions_match(prev_cell.nrows(), batch, "prev_cell batch axis")?;
        validate_dimensions_match(prev_hid.nrows(), batch, "prev_hid batch axis")?;
        if let Some(m) = mask {
            validate_dimensions_match(m.len(), batch, "mask")?;
        }
        Ok(())
    }

    /// One timestep of the recurrence.
    ///
    /// `precomputed_x` optionally carries `x·W_input` (shape (batch,
    /// 4·hidden_size)) when the caller has already projected the whole input
    /// sequence in one batched matrix multiply.
    fn step_impl(
        &self,
        store: &ParameterStore,
        x: ArrayView2<f32>,
        prev_cell: ArrayView2<f32>,
        prev_hid: ArrayView2<f32>,
        mask: Option<ArrayView1<bool>>,
        precomputed_x: Option<ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        self.validate_step_shapes(&x, &prev_cell, &prev_hid, &mask)?;

        let h = self.hidden_size;
        let batch = x.nrows();
        let w_hidden = store.get2(self.w_hidden)?;
        let w_cell = store.get2(self.w_cell)?;
        let bias = store.get2(self.bias)?;

        // Peephole sub-blocks: input/forget share the first 2H columns, the
        // output peephole is the last H columns and sees the *new* cell state.
        let v_if = w_cell.slice(s![.., ..2 * h]);
        let v_o = w_cell.slice(s![.., 2 * h..]);

        let use_parallel = batch * h >= PEEPHOLE_LSTM_PARALLEL_THRESHOLD;

        // Project input, previous hidden and previous cell state onto the
        // gate pre-activation space (parallel or sequential).
        let (transformed_x, (transformed_hid, transformed_cell)) = match precomputed_x {
            Some(tx) => {
                validate_dimensions_match(tx.ncols(), 4 * h, "precomputed input projection")?;
                let (th, tc) = if use_parallel {
                    rayon::join(|| prev_hid.dot(&w_hidden), || prev_cell.dot(&v_if))
                } else {
                    (prev_hid.dot(&w_hidden), prev_cell.dot(&v_if))
                };
                (tx.to_owned(), (th, tc))
            }
            None => {
                let w_input = store.get2(self.w_input)?;
                if use_parallel {
                    rayon::join(
                        || x.dot(&w_input),
                        || rayon::join(|| prev_hid.dot(&w_hidden), || prev_cell.dot(&v_if)),
                    )
                } else {
                    (
                        x.dot(&w_input),
                        (prev_hid.dot(&w_hidden), prev_cell.dot(&v_if)),
                    )
                }
            }
        };

        // Named gate slices, order (input, forget, cell candidate, output)
        let x_i = transformed_x.slice(s![.., ..h]);
        let x_f = transformed_x.slice(s![.., h..2 * h]);
        let x_c = transformed_x.slice(s![.., 2 * h..3 * h]);
        let x_o = transformed_x.slice(s![.., 3 * h..]);
        let h_i = transformed_hid.slice(s![.., ..h]);
        let h_f = transformed_hid.slice(s![.., h..2 * h]);
        let h_c = transformed_hid.slice(s![.., 2 * h..3 * h]);
        let h_o = transformed_hid.slice(s![.., 3 * h..]);
        let c_i = transformed_cell.slice(s![.., ..h]);
        let c_f = transformed_cell.slice(s![.., h..]);

        let mut in_lin = &x_i + &h_i;
        in_lin += &c_i;
        in_lin += &bias.row(0);
        let mut forget_lin = &x_f + &h_f;
        forget_lin += &c_f;
        forget_lin += &bias.row(1);
        let mut cell_lin = &x_c + &h_c;
        cell_lin += &bias.row(2);

        let in_gate = apply_sigmoid(in_lin);
        let forget_gate = apply_sigmoid(forget_lin);
        let cell_candidate = apply_tanh(cell_lin);

        let mut cell = &forget_gate * &prev_cell + &in_gate * &cell_candidate;

        // Output gate peeps at the freshly updated cell state
        let mut out_lin = &x_o + &h_o;
        out_lin += &cell.dot(&v_o);
        out_lin += &bias.row(3);
        let out_gate = apply_sigmoid(out_lin);

        let mut hid = &out_gate * &apply_tanh(cell.clone());

        // Rows with an unset mask are pass-throughs: state is frozen exactly
        if let Some(m) = mask {
            for (b, &keep) in m.iter().enumerate() {
                if !keep {
                    cell.row_mut(b).assign(&prev_cell.row(b));
                    hid.row_mut(b).assign(&prev_hid.row(b));
                }
            }
        }

        Ok((cell, hid))
    }

    /// Runs the layer over a time-major input sequence.
    ///
    /// The initial hidden state is the learnable `init_<name>_hidden`
    /// parameter passed through tanh; the initial cell state is the raw
    /// `init_<name>_cell` parameter. Both are broadcast over the batch axis.
    /// Input projections for all timesteps are computed in a single batched
    /// matrix multiply before the scan, since they do not depend on the
    /// recurrent state.
    ///
    /// The forward pass is cached for a subsequent [`PeepholeLstm::backward`].
    ///
    /// # Parameters
    ///
    /// - `store` - Parameter store holding the layer weights
    /// - `input` - Time-major input with shape (timesteps, batch, input_size)
    ///
    /// # Returns
    ///
    /// - `Ok((cell_seq, hidden_seq))` - Full state trajectories, each with shape (timesteps, batch, hidden_size)
    /// - `Err(ModelError)` - If the input feature axis disagrees with `input_size`
    pub fn forward(
        &mut self,
        store: &ParameterStore,
        input: ArrayView3<f32>,
    ) -> Result<(Array3<f32>, Array3<f32>), ModelError> {
        self.run_forward(store, input, None)
    }

    /// Runs the layer over a time-major input sequence with a validity mask.
    ///
    /// Same contract as [`PeepholeLstm::forward`], with a `(timesteps,
    /// batch)` mask threaded through the scan. Rows whose mask entry is
    /// `false` freeze their state for that timestep, so right-padded
    /// sequences of different lengths can share one batch.
    pub fn forward_with_mask(
        &mut self,
        store: &ParameterStore,
        input: ArrayView3<f32>,
        mask: ArrayView2<bool>,
    ) -> Result<(Array3<f32>, Array3<f32>), ModelError> {
        self.run_forward(store, input, Some(mask))
    }

    /// Builds the batch-broadcast initial state pair `(cell, hidden)`.
    ///
    /// The hidden state is bounded through tanh; the cell state is unbounded.
    fn initial_state(
        &self,
        store: &ParameterStore,
        batch: usize,
    ) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        let init_hidden = store.get1(self.init_hidden)?;
        let init_cell = store.get1(self.init_cell)?;
        let h = self.hidden_size;
        let hidden = Array2::from_shape_fn((batch, h), |(_, j)| init_hidden[j].tanh());
        let cell = Array2::from_shape_fn((batch, h), |(_, j)| init_cell[j]);
        Ok((cell, hidden))
    }

    fn run_forward(
        &mut self,
        store: &ParameterStore,
        input: ArrayView3<f32>,
        mask: Option<ArrayView2<bool>>,
    ) -> Result<(Array3<f32>, Array3<f32>), ModelError> {
        let (timesteps, batch) = (input.shape()[0], input.shape()[1]);
        validate_dimensions_match(input.shape()[2], self.input_size, "input feature axis")?;
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

        let (init_cell, init_hidden) = self.initial_state(store, batch)?;

        // x·W_input for every timestep at once; the projection does not
        // depend on the recurrent state.
        let w_input = store.get2(self.w_input)?;
        let x_flat = input
            .to_shape((timesteps * batch, self.input_size))
            .map_err(|e| ModelError::ProcessingError(format!("failed to flatten input: {}", e)))?;
        let projected = x_flat.dot(&w_input);

        let mut cell_seq = Array3::<f32>::zeros((timesteps, batch, self.hidden_size));
        let mut hidden_seq = Array3::<f32>::zeros((timesteps, batch, self.hidden_size));

        let mut cell = init_cell.clone();
        let mut hid = init_hidden.clone();
        for t in 0..timesteps {
            let x_t = input.index_axis(Axis(0), t);
            let projected_t = projected.slice(s![t * batch..(t + 1) * batch, ..]);
            let mask_t = mask.map(|m| m.index_axis_move(Axis(0), t));
            let (new_cell, new_hid) = self.step_impl(
                store,
                x_t,
                cell.view(),
                hid.view(),
                mask_t,
                Some(projected_t),
            )?;
            cell_seq.index_axis_mut(Axis(0), t).assign(&new_cell);
            hidden_seq.index_axis_mut(Axis(0), t).assign(&new_hid);
            cell = new_cell;
            hid = new_hid;
        }

        self.cache = Some(ForwardCache {
            input: input.to_owned(),
            mask: mask.map(|m| m.to_owned()),
            init_cell,
            init_hidden,
            cell_seq: cell_seq.clone(),
            hidden_seq: hidden_seq.clone(),
        });

        Ok((cell_seq, hidden_seq))
    }

    /// Backpropagation through time over the cached forward pass.
    ///
    /// Gate activations are recomputed per timestep from the cached input and
    /// state trajectories. If the layer was built with a non-negative
    /// `truncate_gradient` horizon, the backward scan only visits that many
    /// trailing timesteps; earlier timesteps and the learnable initial states
    /// receive zero gradient. The forward output is never affected by the
    /// horizon.
    ///
    /// Masked (frozen) rows route their incoming state gradients straight to
    /// the previous timestep and contribute nothing to the parameter
    /// gradients, mirroring the pass-through forward semantics.
    ///
    /// # Parameters
    ///
    /// - `store` - Parameter store holding the layer weights
    /// - `grad_hidden_seq` - Loss gradient with respect to every hidden state, shape (timesteps, batch, hidden_size)
    ///
    /// # Returns
    ///
    /// - `Ok((grad_input, grads))` - Gradient for the input sequence, shape (timesteps, batch, input_size), and the parameter gradients
    /// - `Err(ModelError::ProcessingError)` - If no forward pass has been run
    /// - `Err(ModelError::InputValidationError)` - If the gradient shape disagrees with the cached forward pass
    pub fn backward(
        &mut self,
        store: &ParameterStore,
        grad_hidden_seq: ArrayView3<f32>,
    ) -> Result<(Array3<f32>, PeepholeLstmGradients), ModelError> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| ModelError::ProcessingError("Forward pass has not been run".to_string()))?;

        let (timesteps, batch) = (cache.input.shape()[0], cache.input.shape()[1]);
        let h = self.hidden_size;
        if grad_hidden_seq.shape() != [timesteps, batch, h] {
            return Err(ModelError::InputValidationError(format!(
                "gradient shape {:?} does not match the cached forward pass ({}, {}, {})",
                grad_hidden_seq.shape(),
                timesteps,
                batch,
                h
            )));
        }

        let w_input = store.get2(self.w_input)?;
        let w_hidden = store.get2(self.w_hidden)?;
        let w_cell = store.get2(self.w_cell)?;
        let bias = store.get2(self.bias)?;
        let v_i = w_cell.slice(s![.., ..h]);
        let v_f = w_cell.slice(s![.., h..2 * h]);
        let v_if = w_cell.slice(s![.., ..2 * h]);
        let v_o = w_cell.slice(s![.., 2 * h..]);

        let mut grad_w_input = Array2::<f32>::zeros((self.input_size, 4 * h));
        let mut grad_w_hidden = Array2::<f32>::zeros((h, 4 * h));
        let mut grad_w_cell = Array2::<f32>::zeros((h, 3 * h));
        let mut grad_bias = Array2::<f32>::zeros((4, h));
        let mut grad_input = Array3::<f32>::zeros((timesteps, batch, self.input_size));

        // Truncated BPTT: only the trailing `truncate_gradient` timesteps are
        // visited when the horizon is non-negative.
        let start = if self.truncate_gradient < 0 {
            0
        } else {
            timesteps.saturating_sub(self.truncate_gradient as usize)
        };

        let mut grad_h = Array2::<f32>::zeros((batch, h));
        let mut grad_c = Array2::<f32>::zeros((batch, h));

        for t in (start..timesteps).rev() {
            let x_t = cache.input.index_axis(Axis(0), t);
            let h_prev = if t == 0 {
                cache.init_hidden.view()
            } else {
                cache.hidden_seq.index_axis(Axis(0), t - 1)
            };
            let c_prev = if t == 0 {
                cache.init_cell.view()
            } else {
                cache.cell_seq.index_axis(Axis(0), t - 1)
            };
            let c_t = cache.cell_seq.index_axis(Axis(0), t);

            // Recompute the gate activations for this timestep
            let transformed_x = x_t.dot(&w_input);
            let transformed_hid = h_prev.dot(&w_hidden);
            let transformed_cell = c_prev.dot(&v_if);

            let mut in_lin = &transformed_x.slice(s![.., ..h]) + &transformed_hid.slice(s![.., ..h]);
            in_lin += &transformed_cell.slice(s![.., ..h]);
            in_lin += &bias.row(0);
            let mut forget_lin =
                &transformed_x.slice(s![.., h..2 * h]) + &transformed_hid.slice(s![.., h..2 * h]);
            forget_lin += &transformed_cell.slice(s![.., h..]);
            forget_lin += &bias.row(1);
            let mut cell_lin = &transformed_x.slice(s![.., 2 * h..3 * h])
                + &transformed_hid.slice(s![.., 2 * h..3 * h]);
            cell_lin += &bias.row(2);
            let mut out_lin =
                &transformed_x.slice(s![.., 3 * h..]) + &transformed_hid.slice(s![.., 3 * h..]);
            out_lin += &c_t.dot(&v_o);
            out_lin += &bias.row(3);

            let i_t = apply_sigmoid(in_lin);
            let f_t = apply_sigmoid(forget_lin);
            let g_t = apply_tanh(cell_lin);
            let o_t = apply_sigmoid(out_lin);
            let c_t_activated = apply_tanh(c_t.to_owned());

            let dh_total = &grad_h + &grad_hidden_seq.index_axis(Axis(0), t);
            let dc_total = grad_c;

            // Frozen rows bypass the gate math entirely
            let mask_t = cache.mask.as_ref().map(|m| m.index_axis(Axis(0), t));
            let (mut dh_gate, mut dc_gate) = (dh_total.clone(), dc_total.clone());
            if let Some(m) = mask_t {
                for (b, &keep) in m.iter().enumerate() {
                    if !keep {
                        dh_gate.row_mut(b).fill(0.0);
                        dc_gate.row_mut(b).fill(0.0);
                    }
                }
            }

            // Gradient through h_t = o_t * tanh(c_t)
            let grad_o_t = &dh_gate * &c_t_activated;
            let grad_o_raw = &grad_o_t * &o_t * &(1.0 - &o_t); // sigmoid derivative

            // Gradient into c_t: carried + through h_t + through the output peephole
            let dc = dc_gate
                + &(&dh_gate * &o_t * &(1.0 - &c_t_activated * &c_t_activated))
                + &grad_o_raw.dot(&v_o.t());

            // Gradient through c_t = f_t * c_prev + i_t * g_t
            let grad_f_t = &dc * &c_prev;
            let grad_i_t = &dc * &g_t;
            let grad_g_t = &dc * &i_t;

            let grad_i_raw = &grad_i_t * &i_t * &(1.0 - &i_t); // sigmoid derivative
            let grad_f_raw = &grad_f_t * &f_t * &(1.0 - &f_t); // sigmoid derivative
            let grad_g_raw = &grad_g_t * &(1.0 - &g_t * &g_t); // tanh derivative

            let grad_raw = concatenate(
                Axis(1),
                &[
                    grad_i_raw.view(),
                    grad_f_raw.view(),
                    grad_g_raw.view(),
                    grad_o_raw.view(),
                ],
            )
            .map_err(|e| ModelError::ProcessingError(format!("failed to concatenate: {}", e)))?;

            // Accumulate parameter gradients
            grad_w_input += &x_t.t().dot(&grad_raw);
            grad_w_hidden += &h_prev.t().dot(&grad_raw);
            {
                let mut v_i_grad = grad_w_cell.slice_mut(s![.., ..h]);
                v_i_grad += &c_prev.t().dot(&grad_i_raw);
            }
            {
                let mut v_f_grad = grad_w_cell.slice_mut(s![.., h..2 * h]);
                v_f_grad += &c_prev.t().dot(&grad_f_raw);
            }
            {
                let mut v_o_grad = grad_w_cell.slice_mut(s![.., 2 * h..]);
                v_o_grad += &c_t.t().dot(&grad_o_raw);
            }
            {
                let mut b_i = grad_bias.row_mut(0);
                b_i += &grad_i_raw.sum_axis(Axis(0));
            }
            {
                let mut b_f = grad_bias.row_mut(1);
                b_f += &grad_f_raw.sum_axis(Axis(0));
            }
            {
                let mut b_c = grad_bias.row_mut(2);
                b_c += &grad_g_raw.sum_axis(Axis(0));
            }
            {
                let mut b_o = grad_bias.row_mut(3);
                b_o += &grad_o_raw.sum_axis(Axis(0));
            }

            // Gradients with respect to the step inputs
            let dx = grad_raw.dot(&w_input.t());
            let mut dh_prev = grad_raw.dot(&w_hidden.t());
            let mut dc_prev =
                &dc * &f_t + &grad_i_raw.dot(&v_i.t()) + &grad_f_raw.dot(&v_f.t());

            // Frozen rows pass their gradients straight through
            if let Some(m) = mask_t {
                for (b, &keep) in m.iter().enumerate() {
                    if !keep {
                        dh_prev.row_mut(b).assign(&dh_total.row(b));
                        dc_prev.row_mut(b).assign(&dc_total.row(b));
                    }
                }
            }

            grad_input.index_axis_mut(Axis(0), t).assign(&dx);
            grad_h = dh_prev;
            grad_c = dc_prev;
        }

        // Credit the learnable initial states only when the backward scan
        // reached the beginning of the sequence
        let (grad_init_hidden, grad_init_cell) = if start == 0 {
            let grad_init_cell = grad_c.sum_axis(Axis(0));
            // init hidden enters through tanh; every batch row saw the same value
            let tanh_init = cache.init_hidden.row(0);
            let grad_init_hidden =
                grad_h.sum_axis(Axis(0)) * (1.0 - &tanh_init.to_owned() * &tanh_init);
            (grad_init_hidden, grad_init_cell)
        } else {
            (Array1::<f32>::zeros(h), Array1::<f32>::zeros(h))
        };

        Ok((
            grad_input,
            PeepholeLstmGradients {
                w_input: grad_w_input,
                w_hidden: grad_w_hidden,
                w_cell: grad_w_cell,
                bias: grad_bias,
                init_hidden: grad_init_hidden,
                init_cell: grad_init_cell,
            },
        ))
    }

    /// Applies one step of stochastic gradient descent to the stored
    /// parameters, with element-wise gradient clipping.
    ///
    /// # Parameters
    ///
    /// - `store` - Parameter store holding the layer weights
    /// - `grads` - Gradients produced by [`PeepholeLstm::backward`]
    /// - `lr` - Learning rate
    pub fn sgd_update(
        &self,
        store: &mut ParameterStore,
        grads: &PeepholeLstmGradients,
        lr: f32,
    ) -> Result<(), ModelError> {
        let clip = |g: &Array2<f32>| g.mapv(|x| x.clamp(-GRADIENT_CLIP_VALUE, GRADIENT_CLIP_VALUE));
        let clip1 =
            |g: &Array1<f32>| g.mapv(|x| x.clamp(-GRADIENT_CLIP_VALUE, GRADIENT_CLIP_VALUE));

        {
            let mut w = store.get2_mut(self.w_input)?;
            w -= &(lr * &clip(&grads.w_input));
        }
        {
            let mut w = store.get2_mut(self.w_hidden)?;
            w -= &(lr * &clip(&grads.w_hidden));
        }
        {
            let mut w = store.get2_mut(self.w_cell)?;
            w -= &(lr * &clip(&grads.w_cell));
        }
        {
            let mut b = store.get2_mut(self.bias)?;
            b -= &(lr * &clip(&grads.bias));
        }
        {
            let mut p = store.get1_mut(self.init_hidden)?;
            p -= &(lr * &clip1(&grads.init_hidden));
        }
        {
            let mut p = store.get1_mut(self.init_cell)?;
            p -= &(lr * &clip1(&grads.init_cell));
        }
        Ok(())
    }
}

impl Recurrence for PeepholeLstm {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn step(
        &self,
        store: &ParameterStore,
        x: ArrayView2<f32>,
        prev_cell: ArrayView2<f32>,
        prev_hid: ArrayView2<f32>,
        mask: Option<ArrayView1<bool>>,
    ) -> Result<(Array2<f32>, Array2<f32>), ModelError> {
        self.step_impl(store, x, prev_cell, prev_hid, mask, None)
    }
}
