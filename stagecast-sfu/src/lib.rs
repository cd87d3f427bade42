//! Stagecast SFU session layer
//!
//! Session and media-lifecycle bookkeeping for a selective forwarding relay.
//! Media itself flows through a [`MediaEngine`]; this crate decides who owns
//! which transport, which track is on air in each room, and what happens when
//! a publisher goes away.
//!
//! ## Architecture
//!
//! - **`TransportRegistry`**: per-connection transports and consumers
//! - **`ProducerTable`**: at most one video and one audio track per room
//! - **`SessionManager`**: owns both tables, publishes, subscribes and
//!   reconciles connection loss with a grace period
//! - **`MediaEngine`**: transport/codec engine seam, with an in-process
//!   implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagecast_sfu::{InProcessEngine, SessionManager, SfuConfig, TransportRole};
//!
//! let manager = SessionManager::new(SfuConfig::default(), Arc::new(InProcessEngine::default()));
//! manager.open_connection(conn.clone()).await?;
//! let send = manager.open_transport(&conn, TransportRole::Send).await?;
//! manager.connect_transport(&conn, &send.id, &dtls).await?;
//! let outcome = manager.publish(room, &conn, TrackKind::Video, params).await?;
//! ```

mod broker;
mod capabilities;
mod config;
mod engine;
mod error;
mod events;
mod manager;
mod reconciler;
mod room;
mod track;
mod transport;
mod types;

pub use broker::PublishOutcome;
pub use capabilities::{
    default_capabilities, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
pub use config::{SfuConfig, ViewerScope};
pub use engine::{ConsumerDescriptor, InProcessEngine, MediaEngine, TransportParams};
pub use error::{Result, SfuError};
pub use events::SfuEvent;
pub use manager::{ManagerStats, ProducerStatus, SessionManager};
pub use reconciler::DisconnectReport;
pub use room::{ProducerTable, PublishTransition, RoomProducers};
pub use track::{Track, TrackKind};
pub use transport::{
    ConsumerEntry, ReleasedResources, TransportEntry, TransportRegistry, TransportRole,
    TransportState,
};
pub use types::{ConnectionId, ConsumerId, RoomId, TrackId, TransportId};
