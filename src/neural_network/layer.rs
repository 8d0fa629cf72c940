use super::*;

/// Recurrent layer implementations (peephole LSTM) and the sequence driver
pub mod recurrent_layer;

pub use recurrent_layer::peephole_lstm::{PeepholeLstm, PeepholeLstmGradients};
pub use recurrent_layer::{Recurrence, scan};
