extern crate self as buddyfs_core;

pub mod clique;
pub mod drm;
pub mod error;
pub mod fs;
pub mod node;
pub mod registry;

pub use buddyfs_net as net;
pub use buddyfs_proto as proto;
pub use buddyfs_timing as timing;
pub use buddyfs_utils as utils;
pub use tracing;
