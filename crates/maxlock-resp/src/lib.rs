//! RESP transport for lock nodes.

pub mod codec;
pub mod endpoint;
pub mod errors;
pub mod node;

pub use endpoint::{Endpoint, parse_list};
pub use errors::RespError;
pub use node::RespNode;
