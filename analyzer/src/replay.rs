//! Replay a decoded analyzer capture through the channel handlers into a
//! sink, producing a VCD file or an in-memory waveform trace.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use log::warn;

use crate::device::{self, DeviceDb};
use crate::dump::{DecodedDump, Message};
use crate::handlers::{create_channel_handlers, get_log_channels, Handler, LogHandler};
use crate::sink::{ChannelKind, ChannelSignature, ChannelSignatures, Sink};
use crate::vcd::VcdWriter;
use crate::waveform::{WaveformBuilder, WaveformData};

const DEFAULT_REF_PERIOD: f64 = 1e-9;
const DEFAULT_DDS_SYSCLK: f64 = 3e9;

/// Replay `dump` into `sink`.
///
/// In uniform-interval mode the time axis is the event index rather than the
/// RTIO timestamp; the real timestamp and the inter-event interval become
/// channels of their own.
pub fn decoded_dump_to_target(
    sink: &mut dyn Sink,
    devices: &DeviceDb,
    dump: &DecodedDump,
    uniform_interval: bool,
) -> Result<()> {
    let ref_period = device::ref_period(devices).unwrap_or_else(|| {
        warn!("unable to determine core device ref_period, defaulting to {DEFAULT_REF_PERIOD}s");
        DEFAULT_REF_PERIOD
    });
    let dds_sysclk = device::dds_sysclk(devices).unwrap_or_else(|| {
        warn!("unable to determine DDS sysclk, defaulting to {DEFAULT_DDS_SYSCLK}Hz");
        DEFAULT_DDS_SYSCLK
    });

    let end_time = match dump.messages.last() {
        Some(Message::Stopped { rtio_counter }) => Some(*rtio_counter),
        _ => {
            warn!("capture has no stop message");
            None
        }
    };
    let mut messages: Vec<Message> = dump
        .messages
        .iter()
        .filter(|m| !matches!(m, Message::Stopped { .. }))
        .cloned()
        .collect();
    messages.sort_by_key(Message::time);

    // The first positive time fixes the origin of the trace. Negative times
    // (inputs without a timestamp) never move the cursor and are skipped.
    let start_time = messages
        .iter()
        .map(Message::time)
        .find(|&t| t > 0)
        .unwrap_or(0);

    if uniform_interval {
        sink.set_timescale_ps(1)?;
    } else {
        sink.set_timescale_ps((ref_period * 1e12).round() as u64)?;
        sink.set_start_time(start_time);
    }
    if let Some(end_time) = end_time {
        sink.set_end_time(end_time);
    }

    let mut handlers =
        create_channel_handlers(sink, devices, ref_period, dds_sysclk, dump.dds_onehot_sel)?;
    let log_channels = get_log_channels(dump.log_channel as u32, &messages);
    handlers.insert(
        dump.log_channel as u32,
        Box::new(LogHandler::new(sink, &log_channels)?) as Box<dyn Handler>,
    );

    let uniform_channels = if uniform_interval {
        // RTIO event timestamp in machine units.
        let timestamp = sink.get_channel("timestamp", 64, ChannelKind::Vector, 0, "")?;
        // RTIO event interval in seconds.
        let interval = sink.get_channel("interval", 64, ChannelKind::Analog, 12, "s")?;
        Some((timestamp, interval))
    } else {
        None
    };
    let slack = sink.get_channel("rtio_slack", 64, ChannelKind::Analog, 12, "s")?;

    sink.set_time(if uniform_interval { 0 } else { start_time })?;
    let mut previous_time = 0i64;
    for (i, message) in messages.iter().enumerate() {
        let Some(handler) = message.channel().and_then(|c| handlers.get_mut(&c)) else {
            continue;
        };
        let t = message.time();
        if t >= 0 {
            if let Some((timestamp, interval)) = uniform_channels {
                sink.set_value_double(interval, (t - previous_time) as f64 * ref_period)?;
                sink.set_time(i as i64)?;
                sink.set_value(timestamp, &format!("{t:064b}"))?;
                previous_time = t;
            } else {
                sink.set_time(t)?;
            }
        }
        handler.process_message(sink, message)?;
        if let Message::Output {
            timestamp,
            rtio_counter,
            ..
        } = *message
        {
            sink.set_value_double(slack, (timestamp - rtio_counter) as f64 * ref_period)?;
        }
    }
    Ok(())
}

pub fn decoded_dump_to_vcd<W: Write>(
    out: W,
    devices: &DeviceDb,
    dump: &DecodedDump,
    uniform_interval: bool,
) -> Result<()> {
    let mut vcd = VcdWriter::new(out);
    decoded_dump_to_target(&mut vcd, devices, dump, uniform_interval)
}

pub fn decoded_dump_to_waveform_data(
    devices: &DeviceDb,
    dump: &DecodedDump,
    uniform_interval: bool,
) -> Result<WaveformData> {
    let mut builder = WaveformBuilder::new();
    decoded_dump_to_target(&mut builder, devices, dump, uniform_interval)?;
    Ok(builder.into_trace())
}

/// The channels a replay of any capture against `devices` would declare,
/// without decoding anything. Log channels are capture-dependent and absent.
pub fn get_channel_list(devices: &DeviceDb) -> Result<BTreeMap<String, ChannelSignature>> {
    let ref_period = device::ref_period(devices).unwrap_or(DEFAULT_REF_PERIOD);
    let dds_sysclk = device::dds_sysclk(devices).unwrap_or(DEFAULT_DDS_SYSCLK);
    let mut sink = ChannelSignatures::default();
    create_channel_handlers(&mut sink, devices, ref_period, dds_sysclk, true)?;
    sink.get_channel("rtio_slack", 64, ChannelKind::Analog, 12, "s")?;
    Ok(sink.channels)
}
