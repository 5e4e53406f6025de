//! ARTIQ core device kernel communication
//!
//! Implements the host side of the kernel management protocol: connection
//! handshake, kernel upload and execution, and the RPC serve loop with its
//! tagged value encoding.

pub mod embedding;
pub mod kernel;
pub mod value;
pub mod version;
