//! Observability: structured logging setup and per-service metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{MetricsSnapshot, ServiceMetrics};

pub use logging::{publish_span, receive_span, service_span};
