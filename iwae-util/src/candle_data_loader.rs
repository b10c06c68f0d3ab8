use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

pub struct MinibatchData {
    /// images (b x x_dim...)
    pub input: Tensor,
    /// labels (b), not used by the model
    pub label: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    /// Minibatch `batch_idx` after `shuffle_minibatch` or `order_minibatch`
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// Split samples into consecutive minibatches without shuffling
    fn order_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory image tensor. The first
/// dimension indexes samples.
///
pub struct InMemoryData {
    input_data: Tensor,
    label_data: Option<Tensor>,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `images` and
    /// optional `labels`
    ///
    pub fn new(images: Tensor, labels: Option<Tensor>, seed: u64) -> anyhow::Result<Self> {
        let nsamples = images.dim(0)?;
        if let Some(labels) = labels.as_ref() {
            if labels.dim(0)? != nsamples {
                return Err(anyhow::anyhow!("{} labels for {} samples", labels.dim(0)?, nsamples));
            }
        }

        Ok(InMemoryData {
            input_data: images,
            label_data: labels,
            minibatches: Minibatches {
                samples: (0..nsamples).collect(),
                chunks: vec![],
                rng: StdRng::seed_from_u64(seed),
            },
        })
    }

    fn take_chunk(
        &self,
        samples: &[usize],
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let index = Tensor::from_iter(samples.iter().map(|&i| i as u32), self.input_data.device())?;
        let input = self
            .input_data
            .index_select(&index, 0)?
            .to_device(target_device)?;
        let label = match self.label_data.as_ref() {
            Some(labels) => Some(labels.index_select(&index, 0)?.to_device(target_device)?),
            None => None,
        };
        Ok(MinibatchData { input, label })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(samples) = self.minibatches.chunks.get(batch_idx) {
            self.take_chunk(samples, target_device)
        } else if self.minibatches.chunks.is_empty() {
            Err(anyhow::anyhow!("need to shuffle data"))
        } else {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            ))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size)
    }

    fn order_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.order_minibatch(batch_size)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    rng: StdRng,
}

impl Minibatches {
    /// Random partition; the last chunk may be smaller
    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        let mut order = self.samples.clone();
        order.shuffle(&mut self.rng);
        self.chunks = partition(&order, batch_size)?;
        Ok(())
    }

    pub fn order_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.chunks = partition(&self.samples, batch_size)?;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

fn partition(samples: &[usize], batch_size: usize) -> anyhow::Result<Vec<Vec<usize>>> {
    if batch_size == 0 {
        return Err(anyhow::anyhow!("batch size must be positive"));
    }
    Ok(samples.chunks(batch_size).map(|c| c.to_vec()).collect())
}

///
/// Read an image tensor (n x x_dim...) from `.npy`, or the first array
/// of an `.npz` archive, as f32 on CPU
///
pub fn read_image_tensor(path: &str) -> anyhow::Result<Tensor> {
    let ext = Path::new(path).extension().and_then(|x| x.to_str());
    let tensor = match ext {
        Some("npy") => Tensor::read_npy(path)?,
        Some("npz") => {
            let mut arrays = Tensor::read_npz(path)?;
            if arrays.is_empty() {
                return Err(anyhow::anyhow!("no arrays in {}", path));
            }
            arrays.swap_remove(0).1
        }
        _ => {
            return Err(anyhow::anyhow!("expected `.npy` or `.npz` for {}", path))
        }
    };
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Read a label vector (n) from `.npy`/`.npz`
pub fn read_label_tensor(path: &str) -> anyhow::Result<Tensor> {
    Ok(read_image_tensor(path)?.flatten_all()?.to_dtype(DType::U32)?)
}

/// Average image over the samples (x_dim...)
pub fn mean_image(images: &Tensor) -> anyhow::Result<Tensor> {
    Ok(images.mean(0)?)
}

/// Subtract the `mean` image from every sample
pub fn center_images(images: &Tensor, mean: &Tensor) -> anyhow::Result<Tensor> {
    Ok(images.broadcast_sub(mean)?)
}
