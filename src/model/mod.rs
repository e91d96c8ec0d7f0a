pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod mapping;
pub mod parallel;
pub mod style_encoder;

use burn::module::{ModuleVisitor, Param, ParamId};
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};
pub use mapping::{MappingNetwork, MappingNetworkConfig};
pub use parallel::ParallelModels;
pub use style_encoder::{StyleEncoder, StyleEncoderConfig};

/// Hyperparameters shared by the four networks.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_size: usize,
    pub latent_size: usize,
    pub style_size: usize,
    pub down_size: usize,
    pub num_res: usize,
    #[config(default = true)]
    pub skip_conn: bool,
    #[config(default = 64)]
    pub conv_dim: usize,
    #[config(default = 512)]
    pub max_conv_dim: usize,
    #[config(default = 512)]
    pub mapping_dim: usize,
    #[config(default = 2)]
    pub num_domains: usize,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.conv_dim,
            self.max_conv_dim,
            self.down_size,
            self.num_res,
            self.style_size,
        )
        .with_skip_conn(self.skip_conn)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(
            self.conv_dim,
            self.max_conv_dim,
            self.down_size,
            self.num_domains,
        )
    }

    pub fn mapping_config(&self) -> MappingNetworkConfig {
        MappingNetworkConfig::new(
            self.latent_size,
            self.style_size,
            self.mapping_dim,
            self.num_domains,
        )
    }

    pub fn style_encoder_config(&self) -> StyleEncoderConfig {
        StyleEncoderConfig::new(
            self.conv_dim,
            self.max_conv_dim,
            self.down_size,
            self.style_size,
            self.num_domains,
        )
    }

    /// Largest im2col/col2im workspace of any single generator or discriminator
    /// convolution, in elements per sample.
    pub fn max_conv_workspace_elems(&self) -> u64 {
        let plan = layers::channel_plan(self.conv_dim, self.max_conv_dim, self.down_size);
        let mut size = self.image_size as u64;
        // from_rgb, 3x3 over the full image.
        let mut max_elems = 3 * size * size * 9;

        for pair in plan.windows(2) {
            size = (size + 2 - 4) / 2 + 1;
            max_elems = max_elems.max(pair[0] as u64 * size * size * 16);
        }
        for pair in plan.windows(2).rev() {
            max_elems = max_elems.max(pair[0] as u64 * size * size * 16);
            size *= 2;
        }
        max_elems
    }

    /// Initialize all four networks on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelSet<B> {
        ModelSet {
            generator: self.generator_config().init(device),
            discriminator: self.discriminator_config().init(device),
            mapping_network: self.mapping_config().init(device),
            style_encoder: self.style_encoder_config().init(device),
        }
    }
}

/// The four trainable networks, owned together.
#[derive(Module, Debug)]
pub struct ModelSet<B: Backend> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    pub mapping_network: MappingNetwork<B>,
    pub style_encoder: StyleEncoder<B>,
}

/// Parameter id and shape, in visiting order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamShape {
    pub id: ParamId,
    pub dims: Vec<usize>,
}

struct ShapeCollector {
    params: Vec<ParamShape>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.params.push(ParamShape {
            id: param.id,
            dims: param.val().dims().to_vec(),
        });
    }
}

/// Collect every float parameter of `module` with its shape.
pub fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamShape> {
    let mut collector = ShapeCollector { params: Vec::new() };
    module.visit(&mut collector);
    collector.params
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new(8, 4, 6, 2, 1)
            .with_conv_dim(4)
            .with_max_conv_dim(8)
            .with_mapping_dim(8)
    }

    #[test]
    fn style_paths_agree_on_shape() {
        let device = Default::default();
        let models = tiny_config().init::<TestBackend>(&device);
        let labels =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 1], [3]), &device);

        let noise = Tensor::<TestBackend, 2>::random([3, 4], Distribution::Normal(0.0, 1.0), &device);
        let mapped = models.mapping_network.forward(noise, labels.clone());
        let images =
            Tensor::<TestBackend, 4>::random([3, 3, 8, 8], Distribution::Default, &device);
        let encoded = models.style_encoder.forward(images, labels);

        assert_eq!(mapped.dims(), [3, 6]);
        assert_eq!(mapped.dims(), encoded.dims());
    }

    #[test]
    fn conv_workspace_grows_with_image_size() {
        let small = tiny_config().max_conv_workspace_elems();
        let large = ModelConfig {
            image_size: 16,
            ..tiny_config()
        }
        .max_conv_workspace_elems();
        assert!(small > 0);
        assert!(large > small);
    }

    #[test]
    fn param_shapes_cover_every_network() {
        let device = Default::default();
        let models = tiny_config().init::<TestBackend>(&device);
        let total = param_shapes::<TestBackend, _>(&models).len();
        let parts = param_shapes::<TestBackend, _>(&models.generator).len()
            + param_shapes::<TestBackend, _>(&models.discriminator).len()
            + param_shapes::<TestBackend, _>(&models.mapping_network).len()
            + param_shapes::<TestBackend, _>(&models.style_encoder).len();
        assert!(total > 0);
        assert_eq!(total, parts);
    }
}
