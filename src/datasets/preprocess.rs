use clap::ValueEnum;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a slice of interleaved I/Q samples is laid out for the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Preprocessor {
    /// `(2, S)`: I and Q rows.
    No,
    /// `(4, S)`: I, Q, amplitude and phase rows.
    Tensor,
    /// `(2, S)`: real and imaginary rows of the orthonormal FFT.
    Fft,
    /// `(1, 2S)`: interleaved I/Q in a single channel.
    AddAxis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrainingStrategy {
    Big,
    Fft,
    Tensor,
}

impl Preprocessor {
    /// An explicit preprocessor wins; `no` defers to the training strategy.
    pub fn resolve(self, strategy: TrainingStrategy) -> Preprocessor {
        match (self, strategy) {
            (Preprocessor::No, TrainingStrategy::Fft) => Preprocessor::Fft,
            (Preprocessor::No, TrainingStrategy::Tensor) => Preprocessor::Tensor,
            (p, _) => p,
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Preprocessor::No | Preprocessor::Fft => 2,
            Preprocessor::Tensor => 4,
            Preprocessor::AddAxis => 1,
        }
    }

    pub fn input_len(&self, slice_size: usize) -> usize {
        match self {
            Preprocessor::AddAxis => slice_size * 2,
            _ => slice_size,
        }
    }
}

/// A preprocessor bound to a slice size. Holds the FFT plan, built once per
/// training or test call.
#[derive(Clone)]
pub struct SliceTransform {
    kind: Preprocessor,
    slice_size: usize,
    fft: Option<Arc<dyn Fft<f32>>>,
}

impl std::fmt::Debug for SliceTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceTransform")
            .field("kind", &self.kind)
            .field("slice_size", &self.slice_size)
            .finish()
    }
}

impl SliceTransform {
    pub fn new(kind: Preprocessor, slice_size: usize) -> Self {
        let fft = match kind {
            Preprocessor::Fft => Some(FftPlanner::<f32>::new().plan_fft_forward(slice_size)),
            _ => None,
        };
        Self {
            kind,
            slice_size,
            fft,
        }
    }

    pub fn kind(&self) -> Preprocessor {
        self.kind
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Number of values one transformed slice occupies (`channels * len`).
    pub fn output_len(&self) -> usize {
        self.kind.channels() * self.kind.input_len(self.slice_size)
    }

    /// Transforms one interleaved slice (`2 * slice_size` values) and appends
    /// the channel-first result to `out`.
    pub fn apply_into(&self, iq: &[f32], out: &mut Vec<f32>) {
        debug_assert_eq!(iq.len(), 2 * self.slice_size);
        let i_samples = iq.iter().step_by(2);
        let q_samples = iq.iter().skip(1).step_by(2);
        match self.kind {
            Preprocessor::No => {
                out.extend(i_samples);
                out.extend(q_samples);
            }
            Preprocessor::Tensor => {
                out.extend(i_samples);
                out.extend(q_samples);
                out.extend(iq.chunks_exact(2).map(|s| s[0].hypot(s[1])));
                out.extend(iq.chunks_exact(2).map(|s| s[1].atan2(s[0])));
            }
            Preprocessor::Fft => {
                let mut buffer = iq
                    .chunks_exact(2)
                    .map(|s| Complex::new(s[0], s[1]))
                    .collect::<Vec<_>>();
                if let Some(fft) = &self.fft {
                    fft.process(&mut buffer);
                }
                let scale = 1.0 / (self.slice_size as f32).sqrt();
                out.extend(buffer.iter().map(|c| c.re * scale));
                out.extend(buffer.iter().map(|c| c.im * scale));
            }
            Preprocessor::AddAxis => out.extend_from_slice(iq),
        }
    }

    #[cfg(test)]
    fn apply(&self, iq: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.output_len());
        self.apply_into(iq, &mut out);
        out
    }
}
