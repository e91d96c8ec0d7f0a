use crate::model::{Discriminator, Generator, MappingNetwork, StyleEncoder};
use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamW, AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;

/// Serialized state of one AdamW slot.
pub type OptimRecord<B, M> = <OptimizerAdaptor<AdamW, M, B> as Optimizer<M, B>>::Record;

/// Optimizer bound to one network, holding gradients until the next step.
pub struct OptimizerSlot<B: AutodiffBackend, M: AutodiffModule<B>> {
    optim: OptimizerAdaptor<AdamW, M, B>,
    lr: f64,
    pending: Option<GradientsParams>,
    steps: usize,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> OptimizerSlot<B, M> {
    pub fn new(config: &AdamWConfig, lr: f64) -> Self {
        Self {
            optim: config.init::<B, M>(),
            lr,
            pending: None,
            steps: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Drop pending gradients.
    pub fn zero_grad(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|grads| !grads.is_empty())
    }

    /// Take the gradients of `module`'s parameters out of a backward pass and add
    /// them to anything already pending.
    pub fn accumulate(&mut self, module: &M, grads: &mut B::Gradients) {
        let mut incoming = GradientsParams::from_module(grads, module);
        let pending = match self.pending.take() {
            None => incoming,
            Some(mut pending) => {
                let mut merger = GradsMerger::<B>::new(&mut incoming, &mut pending);
                module.visit(&mut merger);
                pending
            }
        };
        self.pending = Some(pending);
    }

    /// Apply pending gradients to `module` and clear them. Without pending
    /// gradients the module comes back untouched and no step is counted.
    pub fn step(&mut self, module: M) -> M {
        match self.pending.take() {
            Some(grads) if !grads.is_empty() => {
                self.steps += 1;
                self.optim.step(self.lr, module, grads)
            }
            _ => module,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn to_record(&self) -> OptimRecord<B, M> {
        self.optim.to_record()
    }

    pub fn load_record(mut self, record: OptimRecord<B, M>) -> Self {
        self.optim = self.optim.load_record(record);
        self
    }
}

struct GradsMerger<'a, B: AutodiffBackend> {
    incoming: &'a mut GradientsParams,
    pending: &'a mut GradientsParams,
    _phantom: PhantomData<B>,
}

impl<'a, B: AutodiffBackend> GradsMerger<'a, B> {
    fn new(incoming: &'a mut GradientsParams, pending: &'a mut GradientsParams) -> Self {
        Self {
            incoming,
            pending,
            _phantom: PhantomData,
        }
    }
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradsMerger<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.incoming.remove::<B::InnerBackend, D>(param.id) {
            let merged = match self.pending.remove::<B::InnerBackend, D>(param.id) {
                Some(previous) => previous.add(grad),
                None => grad,
            };
            self.pending.register::<B::InnerBackend, D>(param.id, merged);
        }
    }
}

/// Step counters of the four slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub generator: usize,
    pub discriminator: usize,
    pub mapping_network: usize,
    pub style_encoder: usize,
}

/// One AdamW slot per network.
pub struct OptimizerSet<B: AutodiffBackend> {
    pub generator: OptimizerSlot<B, Generator<B>>,
    pub discriminator: OptimizerSlot<B, Discriminator<B>>,
    pub mapping_network: OptimizerSlot<B, MappingNetwork<B>>,
    pub style_encoder: OptimizerSlot<B, StyleEncoder<B>>,
}

impl<B: AutodiffBackend> OptimizerSet<B> {
    /// Generator-side slots run at `g_lr`, the discriminator at `d_lr`.
    pub fn new(adam: &AdamWConfig, g_lr: f64, d_lr: f64) -> Self {
        Self {
            generator: OptimizerSlot::new(adam, g_lr),
            discriminator: OptimizerSlot::new(adam, d_lr),
            mapping_network: OptimizerSlot::new(adam, g_lr),
            style_encoder: OptimizerSlot::new(adam, g_lr),
        }
    }

    pub fn zero_grad(&mut self) {
        self.generator.zero_grad();
        self.discriminator.zero_grad();
        self.mapping_network.zero_grad();
        self.style_encoder.zero_grad();
    }

    pub fn step_counts(&self) -> StepCounts {
        StepCounts {
            generator: self.generator.steps(),
            discriminator: self.discriminator.steps(),
            mapping_network: self.mapping_network.steps(),
            style_encoder: self.style_encoder.steps(),
        }
    }
}

/// AdamW settings shared by every slot.
pub fn adamw_config(beta_1: f64, beta_2: f64, weight_decay: f64) -> AdamWConfig {
    AdamWConfig::new()
        .with_beta_1(beta_1 as f32)
        .with_beta_2(beta_2 as f32)
        .with_weight_decay(weight_decay as f32)
}
