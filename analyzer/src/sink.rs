//! Output abstraction for replayed waveforms.
//!
//! Channel handlers drive one of three sinks: a VCD text writer, an in-memory
//! waveform builder for the GUI, or a schema-only collector used to list the
//! channels a device database would produce without decoding anything.

use anyhow::Result;
use derive_more::{From, Into};

/// Handle to a channel created on a sink.
#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct ChannelRef(pub usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelKind {
    Bit,
    Vector,
    Analog,
    Log,
}

/// Static description of a channel, as recorded in channel lists and next to
/// log traces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSignature {
    pub kind: ChannelKind,
    pub width: u32,
    pub precision: u32,
    pub unit: String,
}

pub trait Sink {
    /// Declare a channel. The name is prefixed with the current scope.
    fn get_channel(
        &mut self,
        name: &str,
        width: u32,
        kind: ChannelKind,
        precision: u32,
        unit: &str,
    ) -> Result<ChannelRef>;

    /// Enter a `scope/name` grouping; every channel created until the
    /// matching [`pop_scope`](Sink::pop_scope) belongs to it.
    fn push_scope(&mut self, scope: &str, name: &str) -> Result<()>;
    fn pop_scope(&mut self) -> Result<()>;

    fn set_timescale_ps(&mut self, _timescale: u64) -> Result<()> {
        Ok(())
    }

    /// Time origin subtracted from every subsequent time.
    fn set_start_time(&mut self, _time: i64) {}

    /// Marks the end of the capture (the stop record's time).
    fn set_end_time(&mut self, _time: i64) {}

    fn set_time(&mut self, time: i64) -> Result<()>;

    /// Set a bit/vector value, e.g. "1", "X" or "0010110...".
    fn set_value(&mut self, channel: ChannelRef, value: &str) -> Result<()>;

    fn set_value_double(&mut self, channel: ChannelRef, value: f64) -> Result<()>;

    fn set_log(&mut self, channel: ChannelRef, message: &str) -> Result<()>;
}

/// Schema-only sink: records every declared channel's signature and drops all
/// values. Backs static channel-list introspection.
#[derive(Default, Debug)]
pub struct ChannelSignatures {
    pub channels: std::collections::BTreeMap<String, ChannelSignature>,
    current_scope: String,
}

impl Sink for ChannelSignatures {
    fn get_channel(
        &mut self,
        name: &str,
        width: u32,
        kind: ChannelKind,
        precision: u32,
        unit: &str,
    ) -> Result<ChannelRef> {
        self.channels.insert(
            format!("{}{}", self.current_scope, name),
            ChannelSignature {
                kind,
                width,
                precision,
                unit: unit.to_string(),
            },
        );
        Ok(ChannelRef(self.channels.len() - 1))
    }

    fn push_scope(&mut self, scope: &str, _name: &str) -> Result<()> {
        self.current_scope = format!("{scope}/");
        Ok(())
    }

    fn pop_scope(&mut self) -> Result<()> {
        self.current_scope.clear();
        Ok(())
    }

    fn set_time(&mut self, _time: i64) -> Result<()> {
        Ok(())
    }

    fn set_value(&mut self, _channel: ChannelRef, _value: &str) -> Result<()> {
        Ok(())
    }

    fn set_value_double(&mut self, _channel: ChannelRef, _value: f64) -> Result<()> {
        Ok(())
    }

    fn set_log(&mut self, _channel: ChannelRef, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_signature_collector_scoping() {
        let mut sink = ChannelSignatures::default();
        sink.get_channel("rtio_slack", 64, ChannelKind::Analog, 12, "s")
            .unwrap();
        sink.push_scope("spi2", "bus").unwrap();
        sink.get_channel("bus/flags", 8, ChannelKind::Vector, 0, "")
            .unwrap();
        sink.pop_scope().unwrap();
        sink.get_channel("ttl/out0", 1, ChannelKind::Bit, 0, "").unwrap();

        let names: Vec<_> = sink.channels.keys().cloned().collect();
        assert_eq!(names, vec!["rtio_slack", "spi2/bus/flags", "ttl/out0"]);
        assert_eq!(
            sink.channels["spi2/bus/flags"],
            ChannelSignature {
                kind: ChannelKind::Vector,
                width: 8,
                precision: 0,
                unit: String::new(),
            }
        );
    }
}
