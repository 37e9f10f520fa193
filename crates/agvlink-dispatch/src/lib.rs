//! Telegram dispatch for AGV fleets.
//!
//! Provides:
//! - Handler routing by device and command
//! - Bounded request/response coordination with retransmission
//! - Per-vehicle adapters with command sequencing and station actions
//! - Reconnect supervision
//! - The [`Engine`] tying it together

pub mod actions;
pub mod adapter;
pub mod coordinator;
pub mod directory;
pub mod engine;
pub mod factory;
pub mod handlers;
pub mod router;
pub mod supervisor;

// Re-exports
pub use actions::{run_supervised, ActionContext, ActionOutcome, ActionRegistry, LocationAction};
pub use adapter::{AdapterContext, AdapterSettings, ProcessModel, VehicleAdapter};
pub use coordinator::RequestResponseCoordinator;
pub use directory::AdapterDirectory;
pub use engine::{Engine, IncomingOutcome, LoggingStopper, VehicleStopper};
pub use factory::{AdapterConfigError, AdapterFactory, DeviceAddress, VehicleProperties};
pub use handlers::{MoveTelegramHandler, PositionReportHandler};
pub use router::{handler_fn, DispatchRouter, FnHandler, Handler, RouteKey, ANY_DEVICE};
pub use supervisor::ConnectionSupervisor;
