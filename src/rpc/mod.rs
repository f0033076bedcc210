//! Node-to-node connectivity: circuit breakers, the node dialer, and the
//! in-process network.

mod breaker;
mod network;
mod nodedialer;

pub use breaker::{Breaker, BreakerConfig, BreakerState};
pub use network::{
    Connection, ConnectionClass, LocalNetwork, NodeService, Transport,
};
pub use nodedialer::{AddressResolver, NodeDialer};
