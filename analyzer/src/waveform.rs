//! In-memory waveform trace builder, the sink behind the GUI-facing
//! `decoded_dump_to_waveform_data` interface.

use std::collections::BTreeMap;

use anyhow::Result;
use typed_index_collections::TiVec;

use crate::sink::{ChannelKind, ChannelRef, ChannelSignature, Sink};

#[derive(Clone, Debug, PartialEq)]
pub enum WaveValue {
    Bits(String),
    Analog(f64),
    Log(String),
}

/// The decoded trace handed to consumers (and persisted as a channel-list
/// file): per-channel value change lists plus log channel signatures.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaveformData {
    /// Picoseconds per time unit.
    pub timescale: u64,
    /// Time of the stop record, relative to the start time. None when the
    /// capture had no stop record.
    pub stopped_x: Option<i64>,
    pub logs: BTreeMap<String, ChannelSignature>,
    pub data: BTreeMap<String, Vec<(i64, WaveValue)>>,
}

#[derive(Default)]
pub struct WaveformBuilder {
    trace: WaveformData,
    /// Full name per channel handle, in creation order.
    names: TiVec<ChannelRef, String>,
    current_scope: String,
    current_time: i64,
    start_time: i64,
}

impl WaveformBuilder {
    pub fn new() -> Self {
        WaveformBuilder {
            trace: WaveformData {
                timescale: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn into_trace(self) -> WaveformData {
        self.trace
    }

    fn push(&mut self, channel: ChannelRef, value: WaveValue) {
        let name = &self.names[channel];
        self.trace
            .data
            .get_mut(name)
            .expect("channel was declared")
            .push((self.current_time, value));
    }
}

impl Sink for WaveformBuilder {
    fn get_channel(
        &mut self,
        name: &str,
        width: u32,
        kind: ChannelKind,
        precision: u32,
        unit: &str,
    ) -> Result<ChannelRef> {
        let full_name = format!("{}{}", self.current_scope, name);
        if kind == ChannelKind::Log {
            self.trace.logs.insert(
                full_name.clone(),
                ChannelSignature {
                    kind,
                    width,
                    precision,
                    unit: unit.to_string(),
                },
            );
        }
        self.trace.data.insert(full_name.clone(), Vec::new());
        Ok(self.names.push_and_get_key(full_name))
    }

    fn push_scope(&mut self, scope: &str, _name: &str) -> Result<()> {
        self.current_scope = format!("{scope}/");
        Ok(())
    }

    fn pop_scope(&mut self) -> Result<()> {
        self.current_scope.clear();
        Ok(())
    }

    fn set_timescale_ps(&mut self, timescale: u64) -> Result<()> {
        self.trace.timescale = timescale;
        Ok(())
    }

    fn set_start_time(&mut self, time: i64) {
        self.start_time = time;
    }

    fn set_end_time(&mut self, time: i64) {
        self.trace.stopped_x = Some(time - self.start_time);
    }

    fn set_time(&mut self, time: i64) -> Result<()> {
        self.current_time = time - self.start_time;
        Ok(())
    }

    fn set_value(&mut self, channel: ChannelRef, value: &str) -> Result<()> {
        self.push(channel, WaveValue::Bits(value.to_string()));
        Ok(())
    }

    fn set_value_double(&mut self, channel: ChannelRef, value: f64) -> Result<()> {
        self.push(channel, WaveValue::Analog(value));
        Ok(())
    }

    fn set_log(&mut self, channel: ChannelRef, message: &str) -> Result<()> {
        self.push(channel, WaveValue::Log(message.to_string()));
        Ok(())
    }
}
