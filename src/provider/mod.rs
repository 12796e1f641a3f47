//! VPN provider controllers
//!
//! Each provider wraps one overlay VPN daemon behind [`ConnectionController`]
//! and is looked up by name in the [`ProviderRegistry`].

pub mod backend;
pub mod common;
pub mod n2n;
pub mod nebula;
pub mod registry;
pub mod tailscale;
pub mod tinc;
pub mod weron;
pub mod zerotier;

pub use backend::{ConnectionController, ConnectionResult, ControllerContext, ControllerFactory, StartRequest};
pub use common::Settings;
pub use registry::ProviderRegistry;
