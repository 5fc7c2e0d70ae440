pub mod parse;
pub mod sampler;
