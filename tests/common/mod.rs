pub mod harness;
pub mod vectors;
