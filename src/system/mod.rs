//! System utilities
//!
//! Accelerator detection for device selection and latency metrics.

pub mod gpu;
pub mod metrics;

pub use gpu::{detect_gpu, select_device, GpuInfo};
pub use metrics::Summary;
