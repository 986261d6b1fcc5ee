pub mod device_map;
mod cache;
mod error;
mod health;
mod key;
mod orchestrator;
mod pipeline;
mod request;
mod util;
mod validate;

pub use cache::PipelineCache;
pub use device_map::*;
pub use error::*;
pub use health::HealthReport;
pub use key::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use request::*;
pub use util::*;
pub use validate::*;
