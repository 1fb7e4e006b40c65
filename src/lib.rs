//! Multi-model router: hosts many named models behind one endpoint while
//! keeping a bounded number of them resident, loading on demand and evicting
//! the least recently used instance when capacity is exceeded.

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod state;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::{SlotPool, SlotStatus};
pub use registry::{ModelDescriptor, ModelRegistry};
pub use state::AppState;
