//! # kiln-events
//!
//! A small, type-parameterized publish/subscribe bus.
//!
//! The bus knows nothing about machines. Producers publish values of some
//! event type `E`; every registered handler receives a clone of each event.
//!
//! ## Dispatch model
//!
//! - Publishing never waits: events are queued and dispatched by a single
//!   background loop started with [`EventBus::start`].
//! - Events from one producer are dispatched in publish order.
//! - For each event, all handlers run concurrently and the loop waits for
//!   every one of them before taking the next event. A slow handler therefore
//!   holds up the whole bus; handlers with long work should spawn it.
//! - A failing or panicking handler is logged and does not affect the other
//!   handlers or the loop.
//! - Cancelling the lifecycle token stops the loop after the event in flight.
//!   Events still queued at that point are discarded.

mod bus;
mod error;

pub use bus::{EventBus, Subscription};
pub use error::BusError;
