//! Supervisory control plane for the telescope's hardware-control processes.
//! Host-driven: no sockets here; the host plugs in a [`Connector`] for peers
//! and feeds [`InboundRequest`]s for the supervisor's own endpoint.

pub mod command;
pub mod peer;
pub mod registry;
pub mod response;
pub mod supervisor;
pub mod transport;

pub use command::{PeerCommand, Reply, SupervisorRequest};
pub use peer::{PeerConnection, PeerError, PeerSummary, PeerTimings, StatusMap};
pub use registry::{PeerRegistry, RegistryError};
pub use response::{
    decode_response, encode_response, Image, Response, ResponseDecodeError, ResponseEncodeError,
};
pub use supervisor::{CommandTable, DispatchError, Supervisor, SupervisorConfig};
pub use transport::{Connector, Endpoint, InboundRequest, Transport};
