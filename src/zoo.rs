//! Backbone architectures available for fine-tuning.
//!
//! Every backbone is a `features` stack whose layers are named
//! `features.{position}`, so weights exported from one run can seed the
//! backbone of the next.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::ImageSpec;
use crate::error::{Error, Result};
use crate::ml::funcs::{Flatten, GlobalAvgPool, MaxPool2d, ReLU};
use crate::ml::params::{Conv2d, Linear};
use crate::ml::{Graph, Node};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// Two hidden fully connected layers on flattened pixels
    Mlp,
    /// Two conv/pool stages and global average pooling
    #[default]
    ConvNet,
    /// VGG-11 layer layout at one eighth of the published width
    Vgg11,
}

/// `M` marks a max pool, numbers are conv output channels.
const VGG11_LAYOUT: [Option<usize>; 13] = [
    Some(8),
    None,
    Some(16),
    None,
    Some(32),
    Some(32),
    None,
    Some(64),
    Some(64),
    None,
    Some(64),
    Some(64),
    None,
];

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Mlp => "mlp",
            Architecture::ConvNet => "conv-net",
            Architecture::Vgg11 => "vgg11",
        }
    }

    /// Smallest square input the architecture accepts.
    pub fn min_input_size(self) -> usize {
        match self {
            Architecture::Mlp => 1,
            Architecture::ConvNet => 4,
            Architecture::Vgg11 => 32,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mlp" => Ok(Architecture::Mlp),
            "conv-net" | "conv_net" | "convnet" => Ok(Architecture::ConvNet),
            "vgg11" => Ok(Architecture::Vgg11),
            other => Err(Error::Config(format!("unknown architecture {other:?}"))),
        }
    }
}

/// Ids of the feature extractor added to a graph.
pub struct Backbone {
    /// Node producing `[batch, feature_dim]`.
    pub output: usize,
    pub feature_dim: usize,
    pub layers: Vec<usize>,
}

/// Appends layers named `features.{i}` in order.
struct FeatureStack<'g> {
    graph: &'g mut Graph,
    last: usize,
    layers: Vec<usize>,
}

impl FeatureStack<'_> {
    fn push<N: Node + 'static>(&mut self, node: N) -> &mut Self {
        let name = format!("features.{}", self.layers.len());
        self.last = self.graph.add_named_layer(name, vec![self.last], Box::new(node));
        self.layers.push(self.last);
        self
    }
}

/// Builds the feature extractor for `arch` on top of `input`, which must
/// carry `[batch, C, H, W]` images matching `spec`.
pub fn build_features(
    graph: &mut Graph,
    input: usize,
    arch: Architecture,
    spec: &ImageSpec,
) -> Result<Backbone> {
    let min = arch.min_input_size();
    if spec.height < min || spec.width < min {
        return Err(Error::Config(format!(
            "{arch} needs images of at least {min}x{min}, got {}x{}",
            spec.height, spec.width
        )));
    }

    let mut stack = FeatureStack {
        graph,
        last: input,
        layers: Vec::new(),
    };

    let feature_dim = match arch {
        Architecture::Mlp => {
            stack
                .push(Flatten::new())
                .push(Linear::auto(spec.pixels(), 256))
                .push(ReLU::new())
                .push(Linear::auto(256, 128))
                .push(ReLU::new());
            128
        }
        Architecture::ConvNet => {
            let mut channels = spec.channels;
            for out in [16, 32] {
                stack
                    .push(Conv2d::auto(channels, out, 3, 1, 1))
                    .push(ReLU::new())
                    .push(MaxPool2d::new());
                channels = out;
            }
            stack.push(GlobalAvgPool::new());
            channels
        }
        Architecture::Vgg11 => {
            let mut channels = spec.channels;
            for entry in VGG11_LAYOUT {
                match entry {
                    Some(out) => {
                        stack.push(Conv2d::auto(channels, out, 3, 1, 1)).push(ReLU::new());
                        channels = out;
                    }
                    None => {
                        stack.push(MaxPool2d::new());
                    }
                }
            }
            stack.push(GlobalAvgPool::new());
            channels
        }
    };

    Ok(Backbone {
        output: stack.last,
        feature_dim,
        layers: stack.layers,
    })
}
