//! Bias add and activation applied after the raw convolution.
//!
//! The kernel writes an un-biased convolution result; a [`BiasActivation`]
//! then produces the final destination from it. The two may share storage.

use crate::error::ConvError;
use crate::memory::TensorND;
use crate::problem::{ConvFormat, NonlinearMode};
use rayon::prelude::*;

/// Fuses bias and nonlinearity into the destination tensor.
pub trait BiasActivation: Send + Sync {
    /// Writes `act(conv_out + bias)` into `dst`.
    ///
    /// `conv_out` may alias `dst` and may carry a different dtype. An absent
    /// `bias` (empty layout) adds nothing.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] when the shapes cannot be combined.
    fn apply(
        &self,
        conv_out: &TensorND,
        dst: &TensorND,
        bias: &TensorND,
        mode: NonlinearMode,
    ) -> Result<(), ConvError>;
}

/// Host implementation using rayon over the flattened destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBiasActivation {
    format: ConvFormat,
}

impl HostBiasActivation {
    #[must_use]
    pub const fn new(format: ConvFormat) -> Self {
        Self { format }
    }
}

/// How a bias tensor maps onto destination elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BiasMode {
    None,
    /// Channel `(i / inner) % channels`.
    PerChannel { channels: usize, inner: usize },
    Full,
}

impl HostBiasActivation {
    fn bias_mode(&self, dst: &TensorND, bias: &TensorND) -> Result<BiasMode, ConvError> {
        let b = &bias.layout;
        let d = &dst.layout;
        if b.is_empty() {
            return Ok(BiasMode::None);
        }
        if b.shape == d.shape {
            return Ok(BiasMode::Full);
        }
        if b.ndim() == 4 && d.ndim() == 4 {
            let (c_axis, inner) = match self.format {
                ConvFormat::Nchw => (1, d.shape[2] * d.shape[3]),
                ConvFormat::Nhwc => (3, 1),
            };
            let broadcast = b
                .shape
                .iter()
                .enumerate()
                .all(|(axis, &n)| if axis == c_axis { n == d.shape[c_axis] } else { n == 1 });
            if broadcast {
                return Ok(BiasMode::PerChannel {
                    channels: d.shape[c_axis],
                    inner,
                });
            }
        }
        Err(ConvError::InvalidLayout(format!(
            "bias {b} cannot be broadcast to {d}"
        )))
    }
}

impl BiasActivation for HostBiasActivation {
    fn apply(
        &self,
        conv_out: &TensorND,
        dst: &TensorND,
        bias: &TensorND,
        mode: NonlinearMode,
    ) -> Result<(), ConvError> {
        if conv_out.layout.total_nr_elems() != dst.layout.total_nr_elems() {
            return Err(ConvError::InvalidLayout(format!(
                "conv output {} does not cover dst {}",
                conv_out.layout, dst.layout
            )));
        }
        let bias_mode = self.bias_mode(dst, bias)?;
        let bias_vals = match bias_mode {
            BiasMode::None => Vec::new(),
            _ => bias.read_f32()?,
        };
        let mut vals = conv_out.read_f32()?;
        vals.par_iter_mut().enumerate().for_each(|(i, v)| {
            let b = match bias_mode {
                BiasMode::None => 0.0,
                BiasMode::PerChannel { channels, inner } => bias_vals[(i / inner) % channels],
                BiasMode::Full => bias_vals[i],
            };
            *v = activate(*v + b, mode);
        });
        dst.write_f32(&vals)
    }
}

/// Applies `mode` to one value.
#[must_use]
pub fn activate(x: f32, mode: NonlinearMode) -> f32 {
    match mode {
        NonlinearMode::Identity => x,
        NonlinearMode::Relu => x.max(0.0),
        NonlinearMode::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        NonlinearMode::HSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
    }
}
