pub mod metrics;

#[cfg(feature = "tracing-basic")]
pub mod logging;

pub use metrics::{GlobalMetrics, LiveMetrics, PerformanceMetrics, TierMetrics};

#[cfg(feature = "tracing-basic")]
pub use logging::{init_tracing, LogFormat};
