pub mod normalizer;
pub mod validation;
pub mod snapshot_writer;
pub mod pipeline;
