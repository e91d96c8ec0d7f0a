#![recursion_limit = "256"]
//! Two-domain image translation with a style-conditioned generator, trained
//! adversarially against a domain-classifying discriminator.

pub mod augment;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod training;
pub mod utils;
