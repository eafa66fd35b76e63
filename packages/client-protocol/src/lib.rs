pub mod encoding;
mod model;
pub mod v1;
pub mod v2;
pub mod versioned;

pub use model::*;

/// Version embedded in `bare` frames and negotiated at upgrade time.
pub const PROTOCOL_VERSION: u16 = 2;
