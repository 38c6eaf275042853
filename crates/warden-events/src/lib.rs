//! # warden-events
//!
//! Namespaced publish/subscribe bus shared by the host and every plugin
//! sandbox. One bus instance is constructed by the host and handed to each
//! sandbox explicitly.
//!
//! ## Name resolution
//!
//! - a name that already contains `:` is used verbatim (`other:saved`);
//! - otherwise, when a plugin id is supplied, the name becomes `plugin:name`;
//! - otherwise the name is global.

pub mod bus;

pub use bus::{
    BusConfig, DeliveryPolicy, EmitReport, EventBus, EventHandler, EventStats, Subscription,
    handler, resolve_event_name,
};
