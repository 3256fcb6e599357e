//! The pretrained classification network the feature extractor is built from.
//!
//! A `Backbone` is an ordered list of named layers plus the fixed
//! preprocessing constants its weights were trained with. It is immutable
//! once constructed and is meant to be shared through an `Arc` by every
//! session that uses it.

use crate::Error;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::{
    collections::HashSet,
    io::{Read, Write},
    path::Path,
};

const BACKBONE_MAGIC: u32 = 0x5354_0001;

/// Per-channel means subtracted from BGR ordered pixels by caffe-style VGG
/// weights
pub const CAFFE_BGR_MEANS: [f64; 3] = [103.939, 116.779, 123.68];

/// The fixed input normalization of a backbone: images are converted from RGB
/// to BGR, then the per-channel means are subtracted.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Preprocessing {
    /// Means in BGR order
    pub channel_means: [f64; 3],
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self {
            channel_means: CAFFE_BGR_MEANS,
        }
    }
}

/// Activation fused into a convolution, so a conv layer's named output is
/// the activated one
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Activation {
    Linear,
    Relu,
}

/// A 2D convolution with frozen weights, laid out as
/// `[out_channels][in_channels][kernel_size][kernel_size]`
#[derive(Clone, Debug, PartialEq)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub padding: usize,
    pub stride: usize,
    pub activation: Activation,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl Conv2d {
    #[inline]
    pub(crate) fn weight(&self, o: usize, i: usize, ky: usize, kx: usize) -> f64 {
        let k = self.kernel_size;
        self.weights[((o * self.in_channels + i) * k + ky) * k + kx]
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// The number of weights the kernel shape calls for, `None` on overflow
    pub fn weight_count(&self) -> Option<usize> {
        self.out_channels
            .checked_mul(self.in_channels)?
            .checked_mul(self.kernel_size)?
            .checked_mul(self.kernel_size)
    }
}

/// Window and stride of a subsampling layer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    pub window: usize,
    pub stride: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LayerKind {
    Conv2d(Conv2d),
    MaxPool(Pool),
    AvgPool(Pool),
}

impl LayerKind {
    /// Returns the window and stride if this layer reduces spatial resolution
    pub fn subsampling(&self) -> Option<Pool> {
        match self {
            Self::MaxPool(pool) | Self::AvgPool(pool) => Some(*pool),
            Self::Conv2d(_) => None,
        }
    }

    fn tag(&self) -> u32 {
        match self {
            Self::Conv2d(_) => 0,
            Self::MaxPool(_) => 1,
            Self::AvgPool(_) => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
}

/// Channel counts of every convolution, grouped by block. Each block ends in
/// a 2x2, stride 2 max-subsampling layer.
#[derive(Clone, Debug)]
pub struct Layout {
    blocks: Vec<Vec<usize>>,
}

impl Layout {
    pub fn new<B, I>(blocks: B) -> Self
    where
        B: IntoIterator<Item = I>,
        I: IntoIterator<Item = usize>,
    {
        Self {
            blocks: blocks
                .into_iter()
                .map(|b| b.into_iter().collect())
                .collect(),
        }
    }

    pub fn vgg16() -> Self {
        Self::new(vec![
            vec![64; 2],
            vec![128; 2],
            vec![256; 3],
            vec![512; 3],
            vec![512; 3],
        ])
    }

    pub fn vgg19() -> Self {
        Self::new(vec![
            vec![64; 2],
            vec![128; 2],
            vec![256; 4],
            vec![512; 4],
            vec![512; 4],
        ])
    }
}

/// A pretrained convolutional network, consumed as a frozen feature source.
#[derive(Clone, Debug)]
pub struct Backbone {
    layers: Vec<Layer>,
    preprocessing: Preprocessing,
}

impl Backbone {
    /// Creates a backbone from an explicit layer list, checking that names are
    /// unique and that every convolution consumes the channels produced by the
    /// layer before it. The network input is always 3 channel BGR.
    pub fn from_layers(layers: Vec<Layer>, preprocessing: Preprocessing) -> Result<Self, Error> {
        if layers.is_empty() {
            return Err(Error::InvalidBackbone("the layer list is empty".to_owned()));
        }

        let mut names = HashSet::new();
        let mut channels = 3;

        for layer in &layers {
            if layer.name.is_empty() {
                return Err(Error::InvalidBackbone("a layer has an empty name".to_owned()));
            }

            if !names.insert(layer.name.as_str()) {
                return Err(Error::InvalidBackbone(format!(
                    "the layer name '{}' is used more than once",
                    layer.name
                )));
            }

            match &layer.kind {
                LayerKind::Conv2d(conv) => {
                    if conv.in_channels != channels {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' expects {} input channels, but receives {}",
                            layer.name, conv.in_channels, channels
                        )));
                    }

                    if conv.kernel_size == 0 || conv.stride == 0 || conv.out_channels == 0 {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' has an empty kernel, stride or output",
                            layer.name
                        )));
                    }

                    if Some(conv.weights.len()) != conv.weight_count()
                        || conv.biases.len() != conv.out_channels
                    {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' has {} weights and {} biases, which doesn't match its shape",
                            layer.name,
                            conv.weights.len(),
                            conv.biases.len()
                        )));
                    }

                    channels = conv.out_channels;
                }
                LayerKind::MaxPool(pool) | LayerKind::AvgPool(pool) => {
                    if pool.window == 0 || pool.stride == 0 {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' has an empty window or stride",
                            layer.name
                        )));
                    }
                }
            }
        }

        Ok(Self {
            layers,
            preprocessing,
        })
    }

    /// Creates a VGG-style backbone with the given layout, using 3x3 padded
    /// ReLU convolutions initialized from `seed`.
    ///
    /// The weights are not trained, so the statistics they extract are far
    /// weaker than those of a real pretrained network, but the topology and
    /// naming are identical.
    pub fn from_layout(layout: &Layout, seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut layers = Vec::new();
        let mut in_channels = 3;

        for (b, block) in layout.blocks.iter().enumerate() {
            for (c, &out_channels) in block.iter().enumerate() {
                let fan_in = (in_channels * 9) as f64;
                let limit = (6.0 / fan_in).sqrt();

                let weights = (0..out_channels * in_channels * 9)
                    .map(|_| rng.gen_range(-limit..limit))
                    .collect();

                layers.push(Layer {
                    name: format!("block{}_conv{}", b + 1, c + 1),
                    kind: LayerKind::Conv2d(Conv2d {
                        in_channels,
                        out_channels,
                        kernel_size: 3,
                        padding: 1,
                        stride: 1,
                        activation: Activation::Relu,
                        weights,
                        biases: vec![0.0; out_channels],
                    }),
                });

                in_channels = out_channels;
            }

            layers.push(Layer {
                name: format!("block{}_pool", b + 1),
                kind: LayerKind::MaxPool(Pool {
                    window: 2,
                    stride: 2,
                }),
            });
        }

        Self {
            layers,
            preprocessing: Preprocessing::default(),
        }
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    #[inline]
    pub fn preprocessing(&self) -> Preprocessing {
        self.preprocessing
    }

    /// The number of layers that reduce spatial resolution
    pub fn subsampling_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.kind.subsampling().is_some())
            .count()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| match &l.kind {
                LayerKind::Conv2d(conv) => conv.parameter_count(),
                _ => 0,
            })
            .sum()
    }

    /// Loads a backbone from a weights file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read(&mut file)
    }

    /// Saves the backbone to a weights file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(parent_path)?;
        }

        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Serializes the backbone, returning the number of bytes written.
    ///
    /// Weights are stored as little endian `f32`.
    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<usize> {
        let mut written = 0;

        written += write_u32(w, BACKBONE_MAGIC)?;
        for mean in &self.preprocessing.channel_means {
            written += write_f32(w, *mean)?;
        }
        written += write_u32(w, self.layers.len() as u32)?;

        for layer in &self.layers {
            written += write_u32(w, layer.name.len() as u32)?;
            w.write_all(layer.name.as_bytes())?;
            written += layer.name.len();
            written += write_u32(w, layer.kind.tag())?;

            match &layer.kind {
                LayerKind::Conv2d(conv) => {
                    for v in &[
                        conv.in_channels,
                        conv.out_channels,
                        conv.kernel_size,
                        conv.padding,
                        conv.stride,
                    ] {
                        written += write_u32(w, *v as u32)?;
                    }
                    written += write_u32(
                        w,
                        match conv.activation {
                            Activation::Linear => 0,
                            Activation::Relu => 1,
                        },
                    )?;

                    for v in conv.weights.iter().chain(conv.biases.iter()) {
                        written += write_f32(w, *v)?;
                    }
                }
                LayerKind::MaxPool(pool) | LayerKind::AvgPool(pool) => {
                    written += write_u32(w, pool.window as u32)?;
                    written += write_u32(w, pool.stride as u32)?;
                }
            }
        }

        Ok(written)
    }

    /// Deserializes a backbone written by `write`
    pub fn read<R: Read>(r: &mut R) -> Result<Self, Error> {
        let magic = read_u32(r)?;
        if magic >> 16 != BACKBONE_MAGIC >> 16 {
            return Err(Error::InvalidBackbone("invalid magic".to_owned()));
        }

        if magic & 0x0000_ffff != 0x1 {
            return Err(Error::InvalidBackbone(format!(
                "unsupported version {}",
                magic & 0x0000_ffff
            )));
        }

        let mut channel_means = [0.0; 3];
        for mean in channel_means.iter_mut() {
            *mean = read_f32(r)?;
        }

        let layer_count = read_u32(r)? as usize;
        let mut layers = Vec::with_capacity(layer_count.min(1024));
        let mut channels = 3;

        for _ in 0..layer_count {
            let name_len = read_u32(r)? as usize;
            let mut name = Vec::new();
            r.by_ref().take(name_len as u64).read_to_end(&mut name)?;
            if name.len() != name_len {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            let name = String::from_utf8(name)
                .map_err(|_err| Error::InvalidBackbone("a layer name isn't utf-8".to_owned()))?;

            let kind = match read_u32(r)? {
                0 => {
                    let mut dims = [0usize; 5];
                    for d in dims.iter_mut() {
                        *d = read_u32(r)? as usize;
                    }
                    let [in_channels, out_channels, kernel_size, padding, stride] = dims;

                    let activation = match read_u32(r)? {
                        0 => Activation::Linear,
                        1 => Activation::Relu,
                        other => {
                            return Err(Error::InvalidBackbone(format!(
                                "layer '{}' has unknown activation {}",
                                name, other
                            )))
                        }
                    };

                    if in_channels != channels {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' expects {} input channels, but receives {}",
                            name, in_channels, channels
                        )));
                    }

                    if kernel_size == 0 || stride == 0 || out_channels == 0 {
                        return Err(Error::InvalidBackbone(format!(
                            "layer '{}' has an empty kernel, stride or output",
                            name
                        )));
                    }

                    let mut conv = Conv2d {
                        in_channels,
                        out_channels,
                        kernel_size,
                        padding,
                        stride,
                        activation,
                        weights: Vec::new(),
                        biases: Vec::new(),
                    };

                    let weight_count = conv.weight_count().ok_or_else(|| {
                        Error::InvalidBackbone(format!("layer '{}' has too many weights", name))
                    })?;
                    conv.weights = read_f32s(r, weight_count)?;
                    conv.biases = read_f32s(r, out_channels)?;
                    channels = out_channels;

                    LayerKind::Conv2d(conv)
                }
                tag @ 1..=2 => {
                    let pool = Pool {
                        window: read_u32(r)? as usize,
                        stride: read_u32(r)? as usize,
                    };

                    if tag == 1 {
                        LayerKind::MaxPool(pool)
                    } else {
                        LayerKind::AvgPool(pool)
                    }
                }
                other => {
                    return Err(Error::InvalidBackbone(format!(
                        "layer '{}' has unknown kind {}",
                        name, other
                    )))
                }
            };

            layers.push(Layer { name, kind });
        }

        Self::from_layers(layers, Preprocessing { channel_means })
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> std::io::Result<usize> {
    w.write_all(&v.to_le_bytes())?;
    Ok(4)
}

fn write_f32<W: Write>(w: &mut W, v: f64) -> std::io::Result<usize> {
    w.write_all(&(v as f32).to_le_bytes())?;
    Ok(4)
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f64::from(f32::from_le_bytes(buf)))
}

/// The number of values `read_f32s` reads at a time
const READ_CHUNK: usize = 1024;

/// Reads `count` values, the buffer only grows with the data actually read
fn read_f32s<R: Read>(r: &mut R, count: usize) -> std::io::Result<Vec<f64>> {
    let mut values = Vec::with_capacity(count.min(READ_CHUNK));
    let mut buf = [0u8; READ_CHUNK * 4];
    let mut remaining = count;

    while remaining > 0 {
        let n = remaining.min(READ_CHUNK);
        let bytes = &mut buf[..n * 4];
        r.read_exact(bytes)?;

        values.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
        );
        remaining -= n;
    }

    Ok(values)
}
