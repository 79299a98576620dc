use super::{ExampleRef, FileType, Stats};
use anyhow::Context;
use candle_core::{DType, Tensor};
use std::path::Path;

/// Options shared by every phase that turns example files into samples.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadOptions {
    pub file_type: FileType,
    pub slice_size: usize,
    pub normalize: bool,
    pub decimated: bool,
    pub add_padding: bool,
    pub try_concat: bool,
    pub crop: usize,
}

/// One loaded example: interleaved I/Q samples and its class index.
#[derive(Clone, Debug, PartialEq)]
pub struct IqSignal {
    pub iq: Vec<f32>,
    pub label: u32,
}

impl IqSignal {
    /// Number of complex samples.
    pub fn len(&self) -> usize {
        self.iq.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.iq.is_empty()
    }
}

fn load_array(path: &Path, file_type: FileType) -> anyhow::Result<Tensor> {
    let tensor = match file_type {
        FileType::Npy => Tensor::read_npy(path)?,
        FileType::Npz => {
            let mut arrays = Tensor::read_npz(path)?;
            if arrays.is_empty() {
                anyhow::bail!("{} holds no arrays", path.display());
            }
            arrays.swap_remove(0).1
        }
    };
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Flattens a stored capture into interleaved I/Q values.
fn to_interleaved(tensor: &Tensor, decimated: bool) -> anyhow::Result<Vec<f32>> {
    match tensor.dims() {
        [_] if decimated => {
            let real = tensor.to_vec1::<f32>()?;
            Ok(real.into_iter().flat_map(|v| [v, 0.0]).collect())
        }
        [n] => {
            if n % 2 != 0 {
                anyhow::bail!("interleaved I/Q array has odd length {n}");
            }
            Ok(tensor.to_vec1::<f32>()?)
        }
        [_, 2] => Ok(tensor.flatten_all()?.to_vec1::<f32>()?),
        [2, _] => Ok(tensor.t()?.contiguous()?.flatten_all()?.to_vec1::<f32>()?),
        dims => anyhow::bail!("unsupported I/Q array shape {dims:?}"),
    }
}

fn normalize(iq: &mut [f32], stats: &Stats) {
    let (Some(mean), Some(std)) = (stats.mean.as_deref(), stats.std.as_deref()) else {
        return;
    };
    if mean.is_empty() || std.is_empty() {
        return;
    }
    let channel = |values: &[f32], c: usize| values[c.min(values.len() - 1)];
    for pair in iq.chunks_exact_mut(2) {
        for (c, v) in pair.iter_mut().enumerate() {
            let s = channel(std, c);
            *v -= channel(mean, c);
            if s > 0.0 {
                *v /= s;
            }
        }
    }
}

/// Brings a capture shorter than one slice up to size. `None` means the
/// example cannot be used with the current options.
fn fit_to_slice(mut iq: Vec<f32>, opts: &ReadOptions) -> Option<Vec<f32>> {
    let needed = opts.slice_size * 2;
    if iq.len() >= needed {
        return Some(iq);
    }
    if opts.try_concat && !iq.is_empty() {
        let original = iq.clone();
        while iq.len() < needed {
            iq.extend_from_slice(&original);
        }
        return Some(iq);
    }
    if opts.add_padding {
        iq.resize(needed, 0.0);
        return Some(iq);
    }
    None
}

/// Loads one example. Returns `Ok(None)` when the capture is shorter than a
/// slice and neither concatenation nor padding is enabled.
pub fn read_example(
    example: &ExampleRef,
    opts: &ReadOptions,
    stats: &Stats,
) -> anyhow::Result<Option<IqSignal>> {
    let tensor = load_array(&example.path, opts.file_type)
        .with_context(|| format!("reading example {}", example.path.display()))?;
    let mut iq = to_interleaved(&tensor, opts.decimated)
        .with_context(|| format!("decoding example {}", example.path.display()))?;

    if opts.crop > 0 && iq.len() > opts.crop * 2 {
        iq.truncate(opts.crop * 2);
    }
    if opts.normalize {
        normalize(&mut iq, stats);
    }
    match fit_to_slice(iq, opts) {
        Some(iq) => Ok(Some(IqSignal {
            iq,
            label: example.label,
        })),
        None => {
            log::warn!(
                "skipping {}: shorter than slice size {}",
                example.id,
                opts.slice_size
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn opts(slice_size: usize) -> ReadOptions {
        ReadOptions {
            file_type: FileType::Npy,
            slice_size,
            normalize: true,
            decimated: false,
            add_padding: true,
            try_concat: false,
            crop: 0,
        }
    }

    fn write(dir: &Path, name: &str, data: Vec<f32>, shape: &[usize]) -> ExampleRef {
        let path = dir.join(name);
        Tensor::from_vec(data, shape.to_vec(), &Device::Cpu)
            .unwrap()
            .write_npy(&path)
            .unwrap();
        ExampleRef {
            id: name.to_string(),
            path,
            label: 3,
        }
    }

    #[test]
    fn reads_rows_and_channel_first_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let rows = write(dir.path(), "rows.npy", vec![1., 2., 3., 4.], &[2, 2]);
        let stats = Stats::default();
        let sig = read_example(&rows, &opts(2), &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1., 2., 3., 4.]);
        assert_eq!(sig.label, 3);

        let cols = write(dir.path(), "cols.npy", vec![1., 3., 5., 2., 4., 6.], &[2, 3]);
        let sig = read_example(&cols, &opts(3), &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1., 2., 3., 4., 5., 6.]);
    }

    #[test]
    fn decimated_files_get_zero_quadrature() {
        let dir = tempfile::tempdir().unwrap();
        let ex = write(dir.path(), "real.npy", vec![1., 2., 3.], &[3]);
        let mut o = opts(3);
        o.decimated = true;
        let sig = read_example(&ex, &o, &Stats::default()).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1., 0., 2., 0., 3., 0.]);
    }

    #[test]
    fn short_examples_are_padded_concatenated_or_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ex = write(dir.path(), "short.npy", vec![1., 2., 3., 4.], &[2, 2]);
        let stats = Stats::default();

        let sig = read_example(&ex, &opts(3), &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1., 2., 3., 4., 0., 0.]);

        let mut o = opts(3);
        o.try_concat = true;
        let sig = read_example(&ex, &o, &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1., 2., 3., 4., 1., 2., 3., 4.]);

        let mut o = opts(3);
        o.add_padding = false;
        assert!(read_example(&ex, &o, &stats).unwrap().is_none());
    }

    #[test]
    fn crop_then_normalize_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let ex = write(dir.path(), "n.npy", vec![3., 5., 5., 9., 7., 7.], &[3, 2]);
        let stats = Stats {
            mean: Some(vec![1.0, 1.0]),
            std: Some(vec![2.0, 4.0]),
        };
        let mut o = opts(2);
        o.crop = 2;
        let sig = read_example(&ex, &o, &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![1.0, 1.0, 2.0, 2.0]);

        o.normalize = false;
        let sig = read_example(&ex, &o, &stats).unwrap().unwrap();
        assert_eq!(sig.iq, vec![3., 5., 5., 9.]);
    }

    #[test]
    fn unsupported_shape_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ex = write(dir.path(), "bad.npy", vec![0.; 12], &[3, 4]);
        assert!(read_example(&ex, &opts(2), &Stats::default()).is_err());
    }
}
