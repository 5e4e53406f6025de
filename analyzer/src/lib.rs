//! RTIO analyzer capture support
//!
//! Decodes raw analyzer dumps from an ARTIQ core device and replays the
//! recorded register traffic into reconstructed waveforms, either as a VCD
//! file or as an in-memory trace.

pub mod device;
pub mod dump;
pub mod handlers;
pub mod proxy;
pub mod replay;
pub mod sink;
pub mod vcd;
pub mod waveform;
