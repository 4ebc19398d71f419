//! Datasets.
//!
//! Datasets are loaded from local files into memory and iterated in shuffled, normalized
//! batches. Downloading is out of scope; point the data path at an existing copy.

use anyhow::{bail, Error, Result};
use ndarray::{s, ArcArray, ArcArray1, Array1, Array4, Ix4};

type ArcArray4<T> = ArcArray<T, Ix4>;
use rand::{rngs::SmallRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, thread::JoinHandle};

/// CIFAR-10.
pub mod cifar10;
/// MNIST.
pub mod mnist;

/// The dataset to train on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// MNIST handwritten digits.
    Mnist,
    /// CIFAR-10 natural images.
    Cifar10,
}

impl FromStr for DatasetKind {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "mnist" => Ok(Self::Mnist),
            "cifar10" => Ok(Self::Cifar10),
            _ => bail!("dataset {input:?} is not supported!"),
        }
    }
}

impl DatasetKind {
    /// The directory name of the dataset.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::Cifar10 => "cifar10",
        }
    }
}

/// An in-memory split of an image dataset.
///
/// Images are `(count, channels, size, size)` normalized to `[-1, 1]`; labels are carried for
/// completeness but unused by training.
#[derive(Clone, Debug)]
pub struct ImageSet {
    images: ArcArray4<f32>,
    labels: ArcArray1<u8>,
}

impl ImageSet {
    /// Creates a set from normalized `images` and `labels`.
    ///
    /// **Errors**
    ///
    /// The counts must match.
    pub fn new(images: Array4<f32>, labels: Array1<u8>) -> Result<Self> {
        anyhow::ensure!(
            images.shape()[0] == labels.len(),
            "found {} images but {} labels!",
            images.shape()[0],
            labels.len()
        );
        Ok(Self {
            images: images.into_shared(),
            labels: labels.into_shared(),
        })
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }
    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The image dimensions `(count, channels, size, size)`.
    pub fn dim(&self) -> Ix4 {
        self.images.raw_dim()
    }
    /// The images.
    pub fn images(&self) -> &ArcArray4<f32> {
        &self.images
    }
    /// The labels.
    pub fn labels(&self) -> &ArcArray1<u8> {
        &self.labels
    }
    fn gather(&self, indices: &[usize]) -> (Array4<f32>, Array1<u8>) {
        let dim = self.images.raw_dim();
        let mut images = Array4::zeros([indices.len(), dim[1], dim[2], dim[3]]);
        let mut labels = Array1::zeros(indices.len());
        for (output, index) in indices.iter().copied().enumerate() {
            images
                .slice_mut(s![output, .., .., ..])
                .assign(&self.images.slice(s![index, .., .., ..]));
            labels[output] = self.labels[index];
        }
        (images, labels)
    }
}

/// Iterates a set in batches, optionally shuffled and prefetched on a worker thread.
#[derive(Debug)]
pub struct Loader {
    set: ImageSet,
    batch_size: usize,
    shuffle: Option<SmallRng>,
    prefetch: usize,
}

impl Loader {
    /// Creates a loader yielding `batch_size` samples per batch.
    pub fn new(set: ImageSet, batch_size: usize) -> Self {
        Self {
            set,
            batch_size: batch_size.max(1),
            shuffle: None,
            prefetch: 0,
        }
    }
    /// Shuffles each epoch with `rng`.
    pub fn with_shuffle(mut self, rng: SmallRng) -> Self {
        self.shuffle.replace(rng);
        self
    }
    /// Prefetches up to `depth` batches on a worker thread.
    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }
    /// The number of batches per epoch, including a trailing partial batch.
    pub fn batch_count(&self) -> usize {
        (self.set.len() + self.batch_size - 1) / self.batch_size
    }
    /// Iterates one epoch of `(images, labels)` batches.
    pub fn batches(&mut self) -> Batches {
        let mut indices = (0..self.set.len()).collect::<Vec<_>>();
        if let Some(rng) = self.shuffle.as_mut() {
            indices.shuffle(rng);
        }
        let chunks = indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect::<Vec<_>>();
        if self.prefetch > 0 {
            let (sender, receiver) = crossbeam_channel::bounded(self.prefetch);
            let set = self.set.clone();
            let handle = std::thread::spawn(move || {
                for chunk in chunks {
                    if sender.send(set.gather(&chunk)).is_err() {
                        break;
                    }
                }
            });
            Batches::Prefetch {
                receiver,
                handle: Some(handle),
            }
        } else {
            Batches::Sync {
                set: self.set.clone(),
                chunks: chunks.into_iter(),
            }
        }
    }
}

/// One epoch of batches.
pub enum Batches {
    #[doc(hidden)]
    Sync {
        set: ImageSet,
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    #[doc(hidden)]
    Prefetch {
        receiver: crossbeam_channel::Receiver<(Array4<f32>, Array1<u8>)>,
        handle: Option<JoinHandle<()>>,
    },
}

impl Iterator for Batches {
    type Item = (Array4<f32>, Array1<u8>);
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Sync { set, chunks } => chunks.next().map(|chunk| set.gather(&chunk)),
            Self::Prefetch { receiver, .. } => receiver.recv().ok(),
        }
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        if let Self::Prefetch { receiver, handle } = self {
            // Disconnect so a blocked worker send fails and the thread exits.
            *receiver = crossbeam_channel::never();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Normalizes a `u8` pixel to `[-1, 1]`.
pub(crate) fn normalize(pixel: u8) -> f32 {
    pixel as f32 / 127.5 - 1.
}
