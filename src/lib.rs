#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod datasets;
pub mod framework;
pub mod models;
