//! Stateful per-channel decoders that replay register writes captured on the
//! RTIO bus into reconstructed physical signals.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::device::{DdsVariant, Device, DeviceDb};
use crate::dump::Message;
use crate::sink::{ChannelKind, ChannelRef, Sink};

pub trait Handler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()>;
}

pub struct TtlHandler {
    name: String,
    channel_value: ChannelRef,
    last_value: String,
    oe: bool,
}

impl TtlHandler {
    pub fn new(sink: &mut dyn Sink, name: &str) -> Result<Self> {
        Ok(TtlHandler {
            name: name.to_string(),
            channel_value: sink.get_channel(&format!("ttl/{name}"), 1, ChannelKind::Bit, 0, "")?,
            last_value: "X".to_string(),
            oe: true,
        })
    }
}

impl Handler for TtlHandler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        match *message {
            Message::Output {
                timestamp,
                address,
                data,
                ..
            } => {
                debug!(
                    "TTL write @{} {} to {}, name: {}",
                    timestamp, data, address, self.name
                );
                if address == 0 {
                    self.last_value = data.to_string();
                    if self.oe {
                        sink.set_value(self.channel_value, &self.last_value)?;
                    }
                } else if address == 1 {
                    self.oe = data != 0;
                    if self.oe {
                        sink.set_value(self.channel_value, &self.last_value)?;
                    } else {
                        sink.set_value(self.channel_value, "X")?;
                    }
                }
            }
            Message::Input {
                timestamp, data, ..
            } => {
                debug!("TTL read  @{} {}, name: {}", timestamp, data, self.name);
                sink.set_value(self.channel_value, &data.to_string())?;
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct TtlClockGenHandler {
    channel_frequency: ChannelRef,
    ref_period: f64,
}

impl TtlClockGenHandler {
    pub fn new(sink: &mut dyn Sink, name: &str, ref_period: f64) -> Result<Self> {
        Ok(TtlClockGenHandler {
            channel_frequency: sink.get_channel(
                &format!("ttl_clkgen/{name}"),
                64,
                ChannelKind::Analog,
                12,
                "Hz",
            )?,
            ref_period,
        })
    }
}

impl Handler for TtlClockGenHandler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        if let Message::Output { data, .. } = *message {
            // The data word is a 24-bit phase accumulator tuning word.
            let frequency = data as f64 / self.ref_period / (1u64 << 24) as f64;
            sink.set_value_double(self.channel_frequency, frequency)?;
        }
        Ok(())
    }
}

/// Fixed register map of a DDS chip variant.
struct DdsRegisterMap {
    select: u32,
    fud: u32,
    ftw: &'static [u32],
    pow: &'static [u32],
    /// Bits carried by each FTW/POW fragment.
    fragment_bits: u32,
    phase_width: u32,
}

impl DdsVariant {
    fn register_map(self) -> DdsRegisterMap {
        match self {
            DdsVariant::Ad9858 => DdsRegisterMap {
                select: 0x41,
                fud: 0x40,
                ftw: &[0x0a, 0x0b, 0x0c, 0x0d],
                pow: &[0x0e, 0x0f],
                fragment_bits: 8,
                phase_width: 14,
            },
            DdsVariant::Ad9914 => DdsRegisterMap {
                select: 0x81,
                fud: 0x80,
                ftw: &[0x11, 0x13],
                pow: &[0x31],
                fragment_bits: 16,
                phase_width: 16,
            },
        }
    }
}

struct DdsChannel {
    frequency: ChannelRef,
    phase: ChannelRef,
    ftw: Vec<Option<u64>>,
    pow: Vec<Option<u64>>,
}

/// Reassemble a register value from per-address fragments; None until every
/// fragment has been written at least once.
fn assemble_fragments(fragments: &[Option<u64>], fragment_bits: u32) -> Option<u128> {
    let mut value = 0u128;
    for (i, fragment) in fragments.iter().enumerate() {
        value |= ((*fragment)? as u128) << (i as u32 * fragment_bits);
    }
    Some(value)
}

impl DdsChannel {
    fn process_fud(
        &mut self,
        sink: &mut dyn Sink,
        registers: &DdsRegisterMap,
        sysclk: f64,
    ) -> Result<()> {
        if let Some(ftw) = assemble_fragments(&self.ftw, registers.fragment_bits) {
            let frequency = ftw as f64 * sysclk / (1u64 << 32) as f64;
            sink.set_value_double(self.frequency, frequency)?;
        }
        if let Some(pow) = assemble_fragments(&self.pow, registers.fragment_bits) {
            let phase = pow as f64 / (1u64 << registers.phase_width) as f64;
            sink.set_value_double(self.phase, phase)?;
        }
        Ok(())
    }
}

pub struct DdsHandler {
    variant: DdsVariant,
    onehot_sel: bool,
    sysclk: f64,
    selected_channels: BTreeSet<u32>,
    channels: BTreeMap<u32, DdsChannel>,
}

impl DdsHandler {
    pub fn new(variant: DdsVariant, onehot_sel: bool, sysclk: f64) -> Self {
        DdsHandler {
            variant,
            onehot_sel,
            sysclk,
            selected_channels: BTreeSet::new(),
            channels: BTreeMap::new(),
        }
    }

    pub fn variant(&self) -> DdsVariant {
        self.variant
    }

    pub fn add_dds_channel(
        &mut self,
        sink: &mut dyn Sink,
        name: &str,
        channel_nr: u32,
    ) -> Result<()> {
        let registers = self.variant.register_map();
        self.channels.insert(
            channel_nr,
            DdsChannel {
                frequency: sink.get_channel(
                    &format!("{name}/frequency"),
                    64,
                    ChannelKind::Analog,
                    12,
                    "Hz",
                )?,
                phase: sink.get_channel(&format!("{name}/phase"), 64, ChannelKind::Analog, 12, "")?,
                ftw: vec![None; registers.ftw.len()],
                pow: vec![None; registers.pow.len()],
            },
        );
        Ok(())
    }

    /// Decode a GPIO select word into the set of addressed sub-channels.
    /// The lowest bit is the chip reset line and is discarded.
    fn gpio_to_channels(&self, gpio: u64) -> BTreeSet<u32> {
        let gpio = gpio >> 1;
        if self.onehot_sel {
            (0..64)
                .filter(|bit| gpio & (1 << bit) != 0)
                .collect()
        } else {
            BTreeSet::from([gpio as u32])
        }
    }

}

impl Handler for DdsHandler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        let Message::Output {
            timestamp,
            address,
            data,
            ..
        } = *message
        else {
            return Ok(());
        };
        debug!("DDS write @{timestamp} 0x{data:08x} to 0x{address:02x}");

        let registers = self.variant.register_map();
        if address == registers.select {
            self.selected_channels = self.gpio_to_channels(data);
        }
        for channel_nr in &self.selected_channels {
            let Some(channel) = self.channels.get_mut(channel_nr) else {
                continue;
            };
            if let Some(i) = registers.ftw.iter().position(|&a| a == address) {
                channel.ftw[i] = Some(data);
            } else if let Some(i) = registers.pow.iter().position(|&a| a == address) {
                channel.pow[i] = Some(data);
            } else if address == registers.fud {
                channel.process_fud(sink, &registers, self.sysclk)?;
            }
        }
        Ok(())
    }
}

/// Wishbone SPI master replay, first revision: reads are queued and paired
/// with a later output carrying the explicit read bit in its address.
pub struct SpiMasterHandler {
    name: String,
    stb: ChannelRef,
    write: ChannelRef,
    chip_select: ChannelRef,
    write_length: ChannelRef,
    read_length: ChannelRef,
    config: ChannelRef,
    read: ChannelRef,
    reads: VecDeque<(i64, u64)>,
}

const SPI_READ_BIT: u32 = 0b100;

impl SpiMasterHandler {
    pub fn new(sink: &mut dyn Sink, name: &str) -> Result<Self> {
        sink.push_scope("spi", name)?;
        let handler = SpiMasterHandler {
            name: name.to_string(),
            stb: sink.get_channel(&format!("{name}/stb"), 1, ChannelKind::Bit, 0, "")?,
            config: sink.get_channel(&format!("{name}/config"), 32, ChannelKind::Vector, 0, "")?,
            chip_select: sink.get_channel(
                &format!("{name}/chip_select"),
                16,
                ChannelKind::Vector,
                0,
                "",
            )?,
            write_length: sink.get_channel(
                &format!("{name}/write_length"),
                8,
                ChannelKind::Vector,
                0,
                "",
            )?,
            read_length: sink.get_channel(
                &format!("{name}/read_length"),
                8,
                ChannelKind::Vector,
                0,
                "",
            )?,
            write: sink.get_channel(&format!("{name}/write"), 32, ChannelKind::Vector, 0, "")?,
            read: sink.get_channel(&format!("{name}/read"), 32, ChannelKind::Vector, 0, "")?,
            reads: VecDeque::new(),
        };
        sink.pop_scope()?;
        Ok(handler)
    }

    fn process_write(&mut self, sink: &mut dyn Sink, address: u32, data: u64) -> Result<()> {
        match address {
            0 => sink.set_value(self.write, &format!("{:032b}", data & 0xffff_ffff))?,
            1 => {
                sink.set_value(self.chip_select, &format!("{:016b}", data & 0xffff))?;
                sink.set_value(self.write_length, &format!("{:08b}", (data >> 16) & 0xff))?;
                sink.set_value(self.read_length, &format!("{:08b}", (data >> 24) & 0xff))?;
            }
            2 => sink.set_value(self.config, &format!("{:032b}", data & 0xffff_ffff))?,
            _ => bail!("bad SPI write address {address} on {}", self.name),
        }
        Ok(())
    }

    fn process_read(
        &mut self,
        sink: &mut dyn Sink,
        address: u32,
        data: u64,
        read_slack: i64,
    ) -> Result<()> {
        debug!("SPI read addr=0x{address:02x} data=0x{data:08x} slack={read_slack}");
        match address {
            0 => sink.set_value(self.read, &format!("{:032b}", data & 0xffff_ffff))?,
            _ => bail!("bad SPI read address {address} on {}", self.name),
        }
        Ok(())
    }
}

impl Handler for SpiMasterHandler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        sink.set_value(self.stb, "1")?;
        sink.set_value(self.stb, "0")?;
        match *message {
            Message::Output {
                timestamp,
                address,
                data,
                ..
            } => {
                debug!(
                    "Wishbone out @{} adr=0x{:02x} data=0x{:08x}",
                    timestamp, address, data
                );
                if address & SPI_READ_BIT != 0 {
                    let (rtio_counter, read_data) = self
                        .reads
                        .pop_front()
                        .with_context(|| format!("SPI read-request on {} with no pending read", self.name))?;
                    self.process_read(
                        sink,
                        address & !SPI_READ_BIT,
                        read_data,
                        rtio_counter - timestamp,
                    )?;
                } else {
                    self.process_write(sink, address, data)?;
                }
            }
            Message::Input {
                rtio_counter, data, ..
            } => {
                debug!("Wishbone in @{} data=0x{:08x}", rtio_counter, data);
                self.reads.push_back((rtio_counter, data));
            }
            _ => {}
        }
        Ok(())
    }
}

/// SPI master replay, second revision: there is no read bit; queued reads are
/// drained before any output whose timestamp passes them.
///
/// A read that arrives with no later output before the end of the stream
/// stays queued and is never delivered; the capture simply ends before the
/// transfer completed.
pub struct SpiMaster2Handler {
    name: String,
    flags: ChannelRef,
    length: ChannelRef,
    div: ChannelRef,
    chip_select: ChannelRef,
    write: ChannelRef,
    read: ChannelRef,
    reads: VecDeque<(i64, u64)>,
}

impl SpiMaster2Handler {
    pub fn new(sink: &mut dyn Sink, name: &str) -> Result<Self> {
        sink.push_scope("spi2", name)?;
        let handler = SpiMaster2Handler {
            name: name.to_string(),
            flags: sink.get_channel(&format!("{name}/flags"), 8, ChannelKind::Vector, 0, "")?,
            length: sink.get_channel(&format!("{name}/length"), 5, ChannelKind::Vector, 0, "")?,
            div: sink.get_channel(&format!("{name}/div"), 8, ChannelKind::Vector, 0, "")?,
            chip_select: sink.get_channel(
                &format!("{name}/chip_select"),
                8,
                ChannelKind::Vector,
                0,
                "",
            )?,
            write: sink.get_channel(&format!("{name}/write"), 32, ChannelKind::Vector, 0, "")?,
            read: sink.get_channel(&format!("{name}/read"), 32, ChannelKind::Vector, 0, "")?,
            reads: VecDeque::new(),
        };
        sink.pop_scope()?;
        Ok(handler)
    }
}

impl Handler for SpiMaster2Handler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        match *message {
            Message::Output {
                timestamp,
                address,
                data,
                ..
            } => {
                match address {
                    1 => {
                        debug!("SPI config @{} data=0x{:08x}", timestamp, data);
                        sink.set_value(self.chip_select, &format!("{:08b}", (data >> 24) & 0xff))?;
                        sink.set_value(self.div, &format!("{:08b}", (data >> 16) & 0xff))?;
                        sink.set_value(self.length, &format!("{:05b}", (data >> 8) & 0x1f))?;
                        sink.set_value(self.flags, &format!("{:08b}", data & 0xff))?;
                    }
                    0 => {
                        debug!("SPI write @{} data=0x{:08x}", timestamp, data);
                        sink.set_value(self.write, &format!("{:032b}", data & 0xffff_ffff))?;
                    }
                    _ => bail!("bad SPI write address {address} on {}", self.name),
                }
                // Insert untimed reads that happened before this output.
                while let Some(&(rtio_counter, data)) = self.reads.front() {
                    if rtio_counter >= timestamp {
                        break;
                    }
                    self.reads.pop_front();
                    debug!("SPI read @{} data=0x{:08x}", rtio_counter, data);
                    sink.set_value(self.read, &format!("{:032b}", data & 0xffff_ffff))?;
                }
            }
            Message::Input {
                rtio_counter, data, ..
            } => {
                self.reads.push_back((rtio_counter, data));
            }
            _ => {}
        }
        Ok(())
    }
}

const LOG_ENTRY_TERMINATOR: char = '\u{1D}';
const LOG_NAME_SEPARATOR: char = '\u{1E}';

/// The low four bytes of the data word carry up to four characters,
/// little-endian, with NUL padding.
fn extract_log_chars(data: u64) -> String {
    (data as u32)
        .to_le_bytes()
        .iter()
        .filter(|&&byte| byte != 0)
        .map(|&byte| byte as char)
        .collect()
}

pub struct LogHandler {
    channels: BTreeMap<String, ChannelRef>,
    current_entry: String,
}

impl LogHandler {
    pub fn new(sink: &mut dyn Sink, log_channels: &BTreeMap<String, usize>) -> Result<Self> {
        let mut channels = BTreeMap::new();
        for (name, max_length) in log_channels {
            channels.insert(
                name.clone(),
                sink.get_channel(
                    &format!("logs/{name}"),
                    (max_length * 8) as u32,
                    ChannelKind::Log,
                    0,
                    "",
                )?,
            );
        }
        Ok(LogHandler {
            channels,
            current_entry: String::new(),
        })
    }
}

impl Handler for LogHandler {
    fn process_message(&mut self, sink: &mut dyn Sink, message: &Message) -> Result<()> {
        if let Message::Output { data, .. } = *message {
            self.current_entry.push_str(&extract_log_chars(data));
            if self.current_entry.len() > 1 && self.current_entry.ends_with(LOG_ENTRY_TERMINATOR) {
                let entry = &self.current_entry[..self.current_entry.len() - 1];
                match entry.split_once(LOG_NAME_SEPARATOR) {
                    Some((channel_name, log_message)) => {
                        let channel = self
                            .channels
                            .get(channel_name)
                            .with_context(|| format!("unknown log channel {channel_name:?}"))?;
                        sink.set_log(*channel, log_message)?;
                    }
                    None => warn!("malformed log entry (no channel separator): {entry:?}"),
                }
                self.current_entry.clear();
            }
        }
        Ok(())
    }
}

/// Pre-scan the capture for complete log entries to size each log channel.
pub fn get_log_channels(log_channel: u32, messages: &[Message]) -> BTreeMap<String, usize> {
    let mut log_channels = BTreeMap::new();
    let mut entry = String::new();
    for message in messages {
        if let Message::Output { channel, data, .. } = *message {
            if channel != log_channel {
                continue;
            }
            entry.push_str(&extract_log_chars(data));
            if entry.len() > 1 && entry.ends_with(LOG_ENTRY_TERMINATOR) {
                if let Some((name, log_message)) = entry[..entry.len() - 1].split_once(LOG_NAME_SEPARATOR)
                {
                    let length = log_message.len();
                    let max = log_channels.entry(name.to_string()).or_insert(length);
                    if *max < length {
                        *max = length;
                    }
                }
                entry.clear();
            }
        }
    }
    log_channels
}

/// Build the handler for every channel the device database describes.
/// Channels without a database entry get no handler; their messages are
/// dropped during replay.
pub fn create_channel_handlers(
    sink: &mut dyn Sink,
    devices: &DeviceDb,
    ref_period: f64,
    dds_sysclk: f64,
    dds_onehot_sel: bool,
) -> Result<BTreeMap<u32, Box<dyn Handler>>> {
    let mut handlers: BTreeMap<u32, Box<dyn Handler>> = BTreeMap::new();
    let mut dds_handlers: BTreeMap<u32, DdsHandler> = BTreeMap::new();

    for (name, device) in devices {
        match *device {
            Device::TtlOut { channel } | Device::TtlInOut { channel } => {
                handlers.insert(channel, Box::new(TtlHandler::new(sink, name)?));
            }
            Device::TtlClockGen { channel } => {
                handlers.insert(
                    channel,
                    Box::new(TtlClockGenHandler::new(sink, name, ref_period)?),
                );
            }
            Device::Dds {
                bus_channel,
                channel,
                variant,
                ..
            } => {
                let handler = dds_handlers
                    .entry(bus_channel)
                    .or_insert_with(|| DdsHandler::new(variant, dds_onehot_sel, dds_sysclk));
                if handler.variant() != variant {
                    bail!(
                        "mismatched DDS chip types ({:?} and {:?}) share bus channel {}",
                        handler.variant(),
                        variant,
                        bus_channel
                    );
                }
                handler.add_dds_channel(sink, name, channel)?;
            }
            Device::SpiMaster { channel } => {
                handlers.insert(channel, Box::new(SpiMasterHandler::new(sink, name)?));
            }
            Device::SpiMaster2 { channel } => {
                handlers.insert(channel, Box::new(SpiMaster2Handler::new(sink, name)?));
            }
            Device::Core { .. } => {}
        }
    }

    for (bus_channel, handler) in dds_handlers {
        if handlers.contains_key(&bus_channel) {
            bail!("DDS bus channel {bus_channel} is already assigned to a non-DDS handler");
        }
        handlers.insert(bus_channel, Box::new(handler));
    }

    Ok(handlers)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::waveform::{WaveValue, WaveformBuilder};

    fn output(channel: u32, timestamp: i64, address: u32, data: u64) -> Message {
        Message::Output {
            channel,
            timestamp,
            rtio_counter: timestamp,
            address,
            data,
        }
    }

    fn input(channel: u32, rtio_counter: i64, data: u64) -> Message {
        Message::Input {
            channel,
            timestamp: rtio_counter,
            rtio_counter,
            data,
        }
    }

    fn bits(data: &[(i64, WaveValue)]) -> Vec<&str> {
        data.iter()
            .map(|(_, value)| match value {
                WaveValue::Bits(s) => s.as_str(),
                other => panic!("expected bits, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_ttl_output_enable_gating() {
        let mut sink = WaveformBuilder::new();
        let mut handler = TtlHandler::new(&mut sink, "out0").unwrap();

        // Disable output, then write while disabled: stays X.
        handler.process_message(&mut sink, &output(0, 0, 1, 0)).unwrap();
        handler.process_message(&mut sink, &output(0, 1, 0, 1)).unwrap();
        // Re-enabling re-emits the stored value.
        handler.process_message(&mut sink, &output(0, 2, 1, 1)).unwrap();

        let trace = sink.into_trace();
        assert_eq!(bits(&trace.data["ttl/out0"]), vec!["X", "1"]);
    }

    #[test]
    fn test_ttl_input_passthrough() {
        let mut sink = WaveformBuilder::new();
        let mut handler = TtlHandler::new(&mut sink, "in0").unwrap();
        handler.process_message(&mut sink, &input(0, 5, 1)).unwrap();
        handler.process_message(&mut sink, &input(0, 6, 0)).unwrap();
        let trace = sink.into_trace();
        assert_eq!(bits(&trace.data["ttl/in0"]), vec!["1", "0"]);
    }

    #[test]
    fn test_clkgen_frequency() {
        let mut sink = WaveformBuilder::new();
        let mut handler = TtlClockGenHandler::new(&mut sink, "clk0", 1e-9).unwrap();
        handler
            .process_message(&mut sink, &output(0, 0, 0, 1 << 23))
            .unwrap();
        let trace = sink.into_trace();
        assert_eq!(
            trace.data["ttl_clkgen/clk0"],
            // Half the 24-bit accumulator range at 1 GHz: 500 MHz.
            vec![(0, WaveValue::Analog(0.5e9))]
        );
    }

    #[test]
    fn test_gpio_select_onehot() {
        let handler = DdsHandler::new(DdsVariant::Ad9914, true, 3e9);
        assert_eq!(handler.gpio_to_channels(0b0011), BTreeSet::from([0]));
        assert_eq!(handler.gpio_to_channels(0b1010), BTreeSet::from([0, 2]));
    }

    #[test]
    fn test_gpio_select_binary() {
        let handler = DdsHandler::new(DdsVariant::Ad9914, false, 3e9);
        assert_eq!(handler.gpio_to_channels(0b0110), BTreeSet::from([3]));
    }

    #[test]
    fn test_ad9914_frequency_decode() {
        let mut sink = WaveformBuilder::new();
        let mut handler = DdsHandler::new(DdsVariant::Ad9914, true, 3e9);
        handler.add_dds_channel(&mut sink, "dds0", 0).unwrap();

        // Select channel 0 (reset bit discarded), stage the FTW halves,
        // then commit with FUD.
        handler.process_message(&mut sink, &output(10, 0, 0x81, 0b0011)).unwrap();
        handler.process_message(&mut sink, &output(10, 1, 0x11, 0x0000_0000)).unwrap();
        handler.process_message(&mut sink, &output(10, 2, 0x13, 0x4000_0000)).unwrap();
        handler.process_message(&mut sink, &output(10, 3, 0x80, 0)).unwrap();

        let ftw = (0x4000_0000u128 << 16) as f64;
        let expected = ftw * 3e9 / (1u64 << 32) as f64;
        let trace = sink.into_trace();
        assert_eq!(
            trace.data["dds0/frequency"],
            vec![(0, WaveValue::Analog(expected))]
        );
        // No POW was staged, so no phase is emitted.
        assert!(trace.data["dds0/phase"].is_empty());
    }

    #[test]
    fn test_ad9914_phase_decode() {
        let mut sink = WaveformBuilder::new();
        let mut handler = DdsHandler::new(DdsVariant::Ad9914, true, 3e9);
        handler.add_dds_channel(&mut sink, "dds0", 0).unwrap();

        handler.process_message(&mut sink, &output(10, 0, 0x81, 0b0011)).unwrap();
        handler.process_message(&mut sink, &output(10, 1, 0x31, 0x8000)).unwrap();
        handler.process_message(&mut sink, &output(10, 2, 0x80, 0)).unwrap();

        let trace = sink.into_trace();
        assert_eq!(trace.data["dds0/phase"], vec![(0, WaveValue::Analog(0.5))]);
    }

    #[test]
    fn test_ad9858_frequency_and_phase_decode() {
        let mut sink = WaveformBuilder::new();
        let mut handler = DdsHandler::new(DdsVariant::Ad9858, true, 1e9);
        handler.add_dds_channel(&mut sink, "dds0", 1).unwrap();

        handler.process_message(&mut sink, &output(10, 0, 0x41, 0b0101)).unwrap();
        for (i, byte) in [0x00u64, 0x00, 0x00, 0x80].into_iter().enumerate() {
            handler
                .process_message(&mut sink, &output(10, 1, 0x0a + i as u32, byte))
                .unwrap();
        }
        handler.process_message(&mut sink, &output(10, 5, 0x0e, 0x00)).unwrap();
        handler.process_message(&mut sink, &output(10, 6, 0x0f, 0x20)).unwrap();
        handler.process_message(&mut sink, &output(10, 7, 0x40, 0)).unwrap();

        let trace = sink.into_trace();
        // FTW = 0x80000000: half the sysclk range.
        assert_eq!(
            trace.data["dds0/frequency"],
            vec![(0, WaveValue::Analog(0.5e9))]
        );
        // POW = 0x2000 of a 14-bit phase accumulator.
        assert_eq!(trace.data["dds0/phase"], vec![(0, WaveValue::Analog(0.5))]);
    }

    #[test]
    fn test_spi_v1_read_pairing() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMasterHandler::new(&mut sink, "spi0").unwrap();

        handler.process_message(&mut sink, &output(4, 0, 0, 0xa5)).unwrap();
        handler
            .process_message(
                &mut sink,
                &Message::Input {
                    channel: 4,
                    timestamp: 10,
                    rtio_counter: 10,
                    data: 0x5a,
                },
            )
            .unwrap();
        handler
            .process_message(&mut sink, &output(4, 20, SPI_READ_BIT, 0))
            .unwrap();

        let trace = sink.into_trace();
        assert_eq!(
            bits(&trace.data["spi/spi0/write"]),
            vec![format!("{:032b}", 0xa5).as_str()]
        );
        assert_eq!(
            bits(&trace.data["spi/spi0/read"]),
            vec![format!("{:032b}", 0x5a).as_str()]
        );
    }

    #[test]
    fn test_spi_v1_read_without_pending_input_fails() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMasterHandler::new(&mut sink, "spi0").unwrap();
        assert!(handler
            .process_message(&mut sink, &output(4, 20, SPI_READ_BIT, 0))
            .is_err());
    }

    #[test]
    fn test_spi_v1_bad_address_is_fatal() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMasterHandler::new(&mut sink, "spi0").unwrap();
        assert!(handler.process_message(&mut sink, &output(4, 0, 3, 0)).is_err());
    }

    #[test]
    fn test_spi_v2_config_decomposition() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMaster2Handler::new(&mut sink, "spi0").unwrap();
        handler
            .process_message(&mut sink, &output(4, 0, 1, 0xab_10_08_02))
            .unwrap();
        let trace = sink.into_trace();
        assert_eq!(bits(&trace.data["spi2/spi0/chip_select"]), vec!["10101011"]);
        assert_eq!(bits(&trace.data["spi2/spi0/div"]), vec!["00010000"]);
        assert_eq!(bits(&trace.data["spi2/spi0/length"]), vec!["01000"]);
        assert_eq!(bits(&trace.data["spi2/spi0/flags"]), vec!["00000010"]);
    }

    #[test]
    fn test_spi_v2_read_drain_ordering() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMaster2Handler::new(&mut sink, "spi0").unwrap();

        // Two untimed reads arrive before the next output's timestamp; a
        // third one is later and must stay queued.
        handler.process_message(&mut sink, &input(4, 10, 0x01)).unwrap();
        handler.process_message(&mut sink, &input(4, 20, 0x02)).unwrap();
        handler.process_message(&mut sink, &input(4, 99, 0x03)).unwrap();
        handler.process_message(&mut sink, &output(4, 50, 0, 0xff)).unwrap();

        let trace = sink.into_trace();
        assert_eq!(
            bits(&trace.data["spi2/spi0/read"]),
            vec![
                format!("{:032b}", 0x01).as_str(),
                format!("{:032b}", 0x02).as_str(),
            ]
        );
    }

    #[test]
    fn test_spi_v2_dangling_read_stays_undelivered() {
        let mut sink = WaveformBuilder::new();
        let mut handler = SpiMaster2Handler::new(&mut sink, "spi0").unwrap();
        // A read with no following output before the end of the stream is
        // never delivered.
        handler.process_message(&mut sink, &input(4, 10, 0x01)).unwrap();
        let trace = sink.into_trace();
        assert!(trace.data["spi2/spi0/read"].is_empty());
    }

    fn log_words(entry: &str) -> Vec<u64> {
        let bytes: Vec<u8> = entry.bytes().collect();
        bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word) as u64
            })
            .collect()
    }

    #[test]
    fn test_log_reassembly() {
        let entry = "print\u{1E}hello world\u{1D}";
        let messages: Vec<Message> = log_words(entry)
            .into_iter()
            .map(|word| output(30, 0, 0, word))
            .collect();

        let log_channels = get_log_channels(30, &messages);
        assert_eq!(log_channels["print"], "hello world".len());

        let mut sink = WaveformBuilder::new();
        let mut handler = LogHandler::new(&mut sink, &log_channels).unwrap();
        for message in &messages {
            handler.process_message(&mut sink, message).unwrap();
        }
        let trace = sink.into_trace();
        assert_eq!(
            trace.data["logs/print"],
            vec![(0, WaveValue::Log("hello world".to_string()))]
        );
    }

    #[test]
    fn test_log_max_length_over_entries() {
        let mut messages = Vec::new();
        for entry in ["a\u{1E}xy\u{1D}", "a\u{1E}longer\u{1D}", "a\u{1E}z\u{1D}"] {
            for word in log_words(entry) {
                messages.push(output(30, 0, 0, word));
            }
        }
        let log_channels = get_log_channels(30, &messages);
        assert_eq!(log_channels["a"], "longer".len());
    }

    #[test]
    fn test_mismatched_dds_variants_fail() {
        use crate::device::Device;
        let mut devices = DeviceDb::new();
        devices.insert(
            "dds0".to_string(),
            Device::Dds {
                bus_channel: 10,
                channel: 0,
                variant: DdsVariant::Ad9914,
                sysclk: 3e9,
            },
        );
        devices.insert(
            "dds1".to_string(),
            Device::Dds {
                bus_channel: 10,
                channel: 1,
                variant: DdsVariant::Ad9858,
                sysclk: 3e9,
            },
        );
        let mut sink = WaveformBuilder::new();
        assert!(create_channel_handlers(&mut sink, &devices, 1e-9, 3e9, true).is_err());
    }
}
