//! LifeGuard Node Library
//!
//! Vehicle accident detection and emergency dispatch.
//!
//! ## Modules
//!
//! - `types` - Core data structures (Profile, Position, readings, messages)
//! - `kinematics` - G-force and haversine displacement math
//! - `detection` - Impact / movement trigger policy
//! - `alert` - Alert cycle state machine and countdown
//! - `dispatch` - Emergency SMS composition (generator + fallback templates)
//! - `session` - Session controller and its async runtime
//! - `api` - HTTP + WebSocket API for the driver UI

pub mod types;
pub mod kinematics;
pub mod detection;
pub mod alert;
pub mod dispatch;
pub mod session;
pub mod api;

pub use types::*;
pub use detection::{DetectionConfig, TriggerPolicy};
pub use alert::{AlertState, AlertStateMachine, CountdownConfig};
pub use dispatch::{MessageDispatcher, RetryPolicy};
pub use session::{Session, SessionConfig, runtime::SessionRuntime};
