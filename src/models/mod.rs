// Core domain models for the message bus gateway
// Plain data, no I/O

//! # Domain Models Module
//!
//! The models are shared by every engine component:
//! - `message`: the envelope producers submit and its log statuses
//! - `app_config`: application, message-code and endpoint configuration
//! - `compensate`: durable records of deliveries that still have to happen
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers can
//! write `use message_bus::models::Message` instead of reaching into the
//! submodule that defines it.

pub mod app_config;
pub mod compensate;
pub mod message;

pub use app_config::{AppConfig, CallbackConfig, MessageConfig, TransportType};
pub use compensate::{CompensateSource, CompensateStatus, MessageCompensate};
pub use message::{Message, MessageStatus, ProcessStatus};
