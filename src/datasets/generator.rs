use super::{read_example, ExampleRef, IqSignal, ReadOptions, SliceTransform, Stats};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

/// Start offsets (in complex samples) of the slices drawn from one training
/// example: `ceil(max(1, n / slice_size) / k)` uniform random positions.
pub fn random_offsets(n: usize, slice_size: usize, k: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    if n < slice_size {
        return Vec::new();
    }
    let windows = (n / slice_size).max(1);
    let count = windows.div_ceil(k.max(1));
    let last = n - slice_size;
    (0..count).map(|_| rng.gen_range(0..=last)).collect()
}

/// Start offsets of evaluation slices: `0, stride, 2 * stride, ...` while the
/// slice fits.
pub fn strided_offsets(n: usize, slice_size: usize, stride: usize) -> Vec<usize> {
    if n < slice_size {
        return Vec::new();
    }
    (0..=n - slice_size).step_by(stride.max(1)).collect()
}

/// Keeps `ceil(shrink * n)` items (at least one when any are present).
pub fn shrink_len(n: usize, shrink: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let keep = (n as f64 * shrink.clamp(0.0, 1.0)).ceil() as usize;
    keep.clamp(1, n)
}

/// Transformed slices ready for batching. `owners[i]` is the position of the
/// slice's example in the IO round it came from.
#[derive(Debug, Default)]
pub struct SliceSet {
    pub data: Vec<f32>,
    pub labels: Vec<u32>,
    pub owners: Vec<usize>,
    slice_len: usize,
}

impl SliceSet {
    pub fn new(slice_len: usize) -> Self {
        Self {
            slice_len,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, signal: &IqSignal, owner: usize, offset: usize, transform: &SliceTransform) {
        let start = offset * 2;
        let end = start + transform.slice_size() * 2;
        transform.apply_into(&signal.iq[start..end], &mut self.data);
        self.labels.push(signal.label);
        self.owners.push(owner);
    }

    pub fn shuffle(&mut self, rng: &mut ChaCha8Rng) {
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        let mut data = Vec::with_capacity(self.data.len());
        for &i in order.iter() {
            data.extend_from_slice(&self.data[i * self.slice_len..(i + 1) * self.slice_len]);
        }
        self.data = data;
        self.labels = order.iter().map(|&i| self.labels[i]).collect();
        self.owners = order.iter().map(|&i| self.owners[i]).collect();
    }

    /// Index ranges of consecutive batches.
    pub fn batch_ranges(&self, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
        let len = self.len();
        let batch_size = batch_size.max(1);
        (0..len)
            .step_by(batch_size)
            .map(move |start| start..(start + batch_size).min(len))
    }

    /// Builds `(inputs, labels)` tensors shaped `(B, C, L)` and `(B,)`.
    pub fn batch(
        &self,
        range: std::ops::Range<usize>,
        shape: (usize, usize),
        device: &Device,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let b = range.len();
        let data = self.data[range.start * self.slice_len..range.end * self.slice_len].to_vec();
        let inputs = Tensor::from_vec(data, (b, shape.0, shape.1), device)?;
        let labels = Tensor::from_vec(self.labels[range].to_vec(), b, device)?;
        Ok((inputs, labels))
    }
}

/// Loads an IO round of examples in parallel. Examples that cannot be used
/// are dropped; the returned vector pairs each signal with its position in
/// `examples`.
pub fn load_round(
    examples: &[ExampleRef],
    opts: &ReadOptions,
    stats: &Stats,
) -> anyhow::Result<Vec<(usize, IqSignal)>> {
    let loaded = examples
        .par_iter()
        .enumerate()
        .map(|(i, ex)| read_example(ex, opts, stats).map(|sig| sig.map(|s| (i, s))))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(loaded.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Preprocessor;
    use rand::SeedableRng;

    #[test]
    fn random_offsets_respect_k_and_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let offsets = random_offsets(1000, 10, 16, &mut rng);
        // 100 windows / 16 rounds up to 7
        assert_eq!(offsets.len(), 7);
        assert!(offsets.iter().all(|&o| o <= 990));
        assert_eq!(random_offsets(10, 10, 16, &mut rng), vec![0]);
        assert!(random_offsets(5, 10, 1, &mut rng).is_empty());
    }

    #[test]
    fn strided_offsets_stop_at_last_full_slice() {
        assert_eq!(strided_offsets(10, 4, 3), vec![0, 3, 6]);
        assert_eq!(strided_offsets(4, 4, 16), vec![0]);
        assert_eq!(strided_offsets(6, 4, 0), vec![0, 1, 2]);
        assert!(strided_offsets(3, 4, 1).is_empty());
    }

    #[test]
    fn shrink_keeps_at_least_one() {
        assert_eq!(shrink_len(10, 1.0), 10);
        assert_eq!(shrink_len(10, 0.25), 3);
        assert_eq!(shrink_len(10, 0.0), 1);
        assert_eq!(shrink_len(0, 0.5), 0);
    }

    #[test]
    fn slice_set_batches_channel_first() {
        let transform = SliceTransform::new(Preprocessor::No, 2);
        let signal = IqSignal {
            iq: vec![1., 2., 3., 4., 5., 6.],
            label: 1,
        };
        let mut set = SliceSet::new(transform.output_len());
        set.push(&signal, 0, 0, &transform);
        set.push(&signal, 0, 1, &transform);
        set.push(&signal, 0, 1, &transform);
        assert_eq!(set.len(), 3);

        let ranges = set.batch_ranges(2).collect::<Vec<_>>();
        assert_eq!(ranges, vec![0..2, 2..3]);

        let (x, y) = set.batch(0..2, (2, 2), &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[2, 2, 2]);
        assert_eq!(
            x.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1., 3.], vec![2., 4.]], vec![vec![3., 5.], vec![4., 6.]]]
        );
        assert_eq!(y.to_vec1::<u32>().unwrap(), vec![1, 1]);
    }

    #[test]
    fn shuffle_keeps_slices_with_their_labels() {
        let transform = SliceTransform::new(Preprocessor::AddAxis, 1);
        let mut set = SliceSet::new(transform.output_len());
        for label in 0..20u32 {
            let signal = IqSignal {
                iq: vec![label as f32, -(label as f32)],
                label,
            };
            set.push(&signal, label as usize, 0, &transform);
        }
        set.shuffle(&mut ChaCha8Rng::seed_from_u64(7));
        for i in 0..set.len() {
            assert_eq!(set.data[2 * i], set.labels[i] as f32);
            assert_eq!(set.owners[i], set.labels[i] as usize);
        }
    }
}
