//! # strobe-core
//!
//! In-process broadcast fan-out for the Strobe toolkit.
//!
//! A single [`Broadcaster`] pulses messages of one type to every
//! [`Subscription`] registered at the time of the pulse:
//!
//! - **Broadcaster** - Subscriber registry, pulse, count and teardown
//! - **Subscription** - A lease with its own delivery channel and lifecycle
//! - **Delivery** - Per-subscriber handoff with a bounded wait
//! - **Config** - Channel capacity and delivery policy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  pulse   ┌─────────────┐  one task per slot  ┌──────────────┐
//! │  Publisher  │─────────▶│ Broadcaster │────────────────────▶│ Subscription │
//! └─────────────┘          └─────────────┘                     └──────────────┘
//!                                 ▲                                   │
//!                                 └──── watcher: unregister + close ──┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use strobe_core::Broadcaster;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broadcaster = Broadcaster::<&str>::new();
//! let mut a = broadcaster.subscribe();
//! let mut b = broadcaster.subscribe();
//!
//! broadcaster.pulse("PING");
//!
//! assert_eq!(a.recv().await, Some("PING"));
//! assert_eq!(b.recv().await, Some("PING"));
//! # }
//! ```

pub mod broadcaster;
pub mod config;
pub mod delivery;
pub mod stats;
pub mod subscription;

pub use broadcaster::{Broadcaster, PulseReport};
pub use config::{BroadcasterConfig, ConfigError, DeliveryPolicy};
pub use delivery::DeliveryError;
pub use stats::BroadcasterStats;
pub use subscription::{Subscription, SubscriptionId};
pub use tokio_util::sync::CancellationToken;
