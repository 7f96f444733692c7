//! Monitor subsystem: a shared-memory publish/subscribe event bus.
//!
//! All state lives in one file-backed region mapped by every participant.
//! Publishers route small events by topic name to subscribers over
//! per-endpoint SPSC channels; a monitor process supervises the region,
//! reclaims endpoints of dead processes, and coordinates shutdown.

pub mod api;
pub mod bitmap;
pub mod channel;
pub mod clock;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod lock;
pub mod mmap;
pub mod monitor;
pub mod process;
pub mod shmem;
pub mod topic;
pub mod wait;

pub use api::inspect::RegionSnapshot;
pub use api::{Delivery, Event, Mss, MssConfig, Publisher, Subscriber};
pub use channel::{ChannelConfig, ChannelOptions, ChannelType};
pub use clock::{Clock, QuantaClock, SystemClock};
pub use error::{Error, Result, ReturnCode};
pub use monitor::{Monitor, MonitorConfig, MonitorHandle, MonitorReport, MonitorState, ShutdownMode};
pub use process::ProcessIdentity;
pub use shmem::Region;
pub use topic::RoutingMode;
