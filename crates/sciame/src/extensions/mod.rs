//! Protocols spoken with peers: the core wire protocol and the extensions
//! negotiated on top of it.

pub mod core;
pub mod extended;
pub mod metadata;
pub mod pex;

pub use self::core::*;
pub use self::extended::*;
pub use self::metadata::*;
pub use self::pex::*;
