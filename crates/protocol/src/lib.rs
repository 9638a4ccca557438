pub mod config;
pub mod coords;
pub mod demux;
pub mod messages;

pub use config::*;
pub use coords::*;
pub use demux::*;
pub use messages::*;
