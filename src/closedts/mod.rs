//! Closed timestamps: lets followers serve consistent reads slightly in the
//! past.

pub mod ctpb;
pub mod minprop;
pub mod storage;

mod container;
mod provider;
mod transport;

pub use container::{
    can_serve_follower_read, ClosedTsConfig, Container, FollowerReadCheck,
};
pub use provider::Provider;
pub use transport::{Clients, RefreshFn, Server};
