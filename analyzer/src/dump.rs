//! Decoding of raw analyzer dumps into typed message records.
//!
//! A dump is one endianness byte, a 15-byte header and then a sequence of
//! fixed 32-byte records. Only the header honours the endianness byte; the
//! records themselves are always big-endian, exactly as the gateware emits
//! them into its ring buffer.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use log::{info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Endianness selected by the first byte of a dump or proxy frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub fn from_tag(byte: u8) -> Result<Self> {
        match byte {
            b'E' => Ok(Endianness::Big),
            b'e' => Ok(Endianness::Little),
            _ => bail!("unknown endianness byte {byte:#04x}"),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Big => BigEndian::read_u32(buf),
            Endianness::Little => LittleEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endianness::Big => BigEndian::read_u64(buf),
            Endianness::Little => LittleEndian::read_u64(buf),
        }
    }
}

/// RTIO fault codes reported by the core through the analyzer stream.
/// The numeric values are a contract with the gateware.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ExceptionType {
    LegacyReset = 0b000000,
    LegacyResetFalling = 0b000001,
    LegacyResetPhy = 0b000010,
    LegacyResetPhyFalling = 0b000011,

    LegacyOUnderflowReset = 0b010000,
    LegacyOSequenceErrorReset = 0b010001,
    LegacyOCollisionReset = 0b010010,
    OUnderflow = 0b010100,
    LegacyOSequenceError = 0b010101,

    LegacyIOverflowReset = 0b100000,
    IOverflow = 0b100001,
}

impl ExceptionType {
    /// The wire code for this fault kind.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One decoded 32-byte analyzer record.
///
/// Timestamps and counter values are kept signed: input records use the
/// all-ones pattern to mean "no timestamp" and the replay logic needs to
/// see that as a negative time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Output {
        channel: u32,
        timestamp: i64,
        rtio_counter: i64,
        address: u32,
        data: u64,
    },
    Input {
        channel: u32,
        timestamp: i64,
        rtio_counter: i64,
        data: u64,
    },
    Exception {
        channel: u32,
        rtio_counter: i64,
        exception_type: ExceptionType,
    },
    Stopped {
        rtio_counter: i64,
    },
}

#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
enum MessageType {
    Output = 0b00,
    Input = 0b01,
    Exception = 0b10,
    Stopped = 0b11,
}

impl Message {
    /// The instant this message is replayed at: the scheduled timestamp for
    /// output/input records, the counter value for exception/stopped records.
    pub fn time(&self) -> i64 {
        match *self {
            Message::Output { timestamp, .. } => timestamp,
            Message::Input { timestamp, .. } => timestamp,
            Message::Exception { rtio_counter, .. } => rtio_counter,
            Message::Stopped { rtio_counter } => rtio_counter,
        }
    }

    /// The RTIO channel this message belongs to, if any.
    pub fn channel(&self) -> Option<u32> {
        match *self {
            Message::Output { channel, .. } => Some(channel),
            Message::Input { channel, .. } => Some(channel),
            Message::Exception { channel, .. } => Some(channel),
            Message::Stopped { .. } => None,
        }
    }
}

/// Decode a single 32-byte analyzer record (always big-endian).
pub fn decode_message(record: &[u8; 32]) -> Result<Message> {
    let message_type_channel = BigEndian::read_u32(&record[28..32]);
    // The low two bits select the record type, the rest is the channel.
    let message_type = MessageType::from_u32(message_type_channel & 0b11)
        .expect("two-bit message type is always in range");
    let channel = message_type_channel >> 2;

    Ok(match message_type {
        MessageType::Output => {
            let mut payload = &record[0..28];
            let data = payload.read_u64::<BigEndian>()?;
            let address = payload.read_u32::<BigEndian>()?;
            let rtio_counter = payload.read_u64::<BigEndian>()? as i64;
            let timestamp = payload.read_u64::<BigEndian>()? as i64;
            Message::Output {
                channel,
                timestamp,
                rtio_counter,
                address,
                data,
            }
        }
        MessageType::Input => {
            let mut payload = &record[0..28];
            let data = payload.read_u64::<BigEndian>()?;
            // The address field is present but unused for inputs.
            let _address = payload.read_u32::<BigEndian>()?;
            let rtio_counter = payload.read_u64::<BigEndian>()? as i64;
            let timestamp = payload.read_u64::<BigEndian>()? as i64;
            Message::Input {
                channel,
                timestamp,
                rtio_counter,
                data,
            }
        }
        MessageType::Exception => {
            let mut payload = &record[11..20];
            let code = payload.read_u8()?;
            let exception_type = ExceptionType::from_u8(code)
                .with_context(|| format!("unknown RTIO exception type {code:#04x}"))?;
            let rtio_counter = payload.read_u64::<BigEndian>()? as i64;
            Message::Exception {
                channel,
                rtio_counter,
                exception_type,
            }
        }
        MessageType::Stopped => {
            let rtio_counter = BigEndian::read_u64(&record[12..20]) as i64;
            Message::Stopped { rtio_counter }
        }
    })
}

/// One complete analyzer capture, decoded. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedDump {
    pub log_channel: u8,
    pub dds_onehot_sel: bool,
    pub messages: Vec<Message>,
}

/// Decode a raw analyzer dump.
///
/// A length mismatch between the header's `sent_bytes` and the actual buffer
/// is fatal: it means the framing upstream has desynchronised and none of the
/// records can be trusted. An analyzer-side error flag or a wrapped ring
/// buffer only degrade the capture and are logged instead.
pub fn decode_dump(data: &[u8]) -> Result<DecodedDump> {
    let endian = match data.first() {
        Some(&byte) => Endianness::from_tag(byte).context("analyzer dump endianness")?,
        None => bail!("empty analyzer dump"),
    };
    let data = &data[1..];
    if data.len() < 15 {
        bail!("analyzer dump shorter than its 15-byte header");
    }

    let sent_bytes = endian.read_u32(&data[0..4]);
    let total_byte_count = endian.read_u64(&data[4..12]);
    let error_occurred = data[12] != 0;
    let log_channel = data[13];
    let dds_onehot_sel = data[14] != 0;

    if data.len() as u64 != sent_bytes as u64 + 15 {
        bail!(
            "analyzer dump has incorrect length: {} bytes after the endianness byte, \
             header claims {}",
            data.len(),
            sent_bytes as u64 + 15
        );
    }
    if error_occurred {
        warn!("error occurred within the analyzer, the dump may be corrupted");
    }
    if sent_bytes != 0 && total_byte_count > sent_bytes as u64 {
        info!(
            "analyzer ring buffer has wrapped {} times",
            total_byte_count / sent_bytes as u64
        );
    }
    if sent_bytes == 0 {
        warn!("analyzer dump is empty");
    }

    let mut messages = Vec::with_capacity(sent_bytes as usize / 32);
    for record in data[15..].chunks_exact(32) {
        let record: &[u8; 32] = record.try_into().expect("chunks_exact yields 32 bytes");
        messages.push(decode_message(record)?);
    }

    if let [Message::Stopped { .. }] = &messages[..] {
        warn!("analyzer dump is empty aside from stop message");
    }

    Ok(DecodedDump {
        log_channel,
        dds_onehot_sel,
        messages,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use byteorder::{BigEndian, ByteOrder};

    pub fn output_record(channel: u32, timestamp: u64, rtio_counter: u64, address: u32, data: u64) -> [u8; 32] {
        let mut record = [0; 32];
        BigEndian::write_u64(&mut record[0..8], data);
        BigEndian::write_u32(&mut record[8..12], address);
        BigEndian::write_u64(&mut record[12..20], rtio_counter);
        BigEndian::write_u64(&mut record[20..28], timestamp);
        BigEndian::write_u32(&mut record[28..32], channel << 2);
        record
    }

    pub fn input_record(channel: u32, timestamp: u64, rtio_counter: u64, data: u64) -> [u8; 32] {
        let mut record = [0; 32];
        BigEndian::write_u64(&mut record[0..8], data);
        BigEndian::write_u64(&mut record[12..20], rtio_counter);
        BigEndian::write_u64(&mut record[20..28], timestamp);
        BigEndian::write_u32(&mut record[28..32], (channel << 2) | 0b01);
        record
    }

    pub fn exception_record(channel: u32, rtio_counter: u64, code: u8) -> [u8; 32] {
        let mut record = [0; 32];
        record[11] = code;
        BigEndian::write_u64(&mut record[12..20], rtio_counter);
        BigEndian::write_u32(&mut record[28..32], (channel << 2) | 0b10);
        record
    }

    pub fn stopped_record(rtio_counter: u64) -> [u8; 32] {
        let mut record = [0; 32];
        BigEndian::write_u64(&mut record[12..20], rtio_counter);
        BigEndian::write_u32(&mut record[28..32], 0b11);
        record
    }

    /// Assemble a big-endian dump from records.
    pub fn dump_bytes(log_channel: u8, dds_onehot_sel: bool, records: &[[u8; 32]]) -> Vec<u8> {
        let sent_bytes = (records.len() * 32) as u32;
        let mut data = Vec::with_capacity(16 + records.len() * 32);
        data.push(b'E');
        data.extend_from_slice(&sent_bytes.to_be_bytes());
        data.extend_from_slice(&(sent_bytes as u64).to_be_bytes());
        data.push(0);
        data.push(log_channel);
        data.push(dds_onehot_sel as u8);
        for record in records {
            data.extend_from_slice(record);
        }
        data
    }
}

#[cfg(test)]
mod test {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_decode_output_message() {
        let record = output_record(0x155, 1000, 900, 1, 0xdead_beef);
        let message = decode_message(&record).unwrap();
        assert_eq!(
            message,
            Message::Output {
                channel: 0x155,
                timestamp: 1000,
                rtio_counter: 900,
                address: 1,
                data: 0xdead_beef,
            }
        );
        assert_eq!(message.time(), 1000);
        assert_eq!(message.channel(), Some(0x155));
    }

    #[test]
    fn test_decode_input_message_without_timestamp() {
        let record = input_record(3, u64::MAX, 500, 1);
        let message = decode_message(&record).unwrap();
        assert_eq!(
            message,
            Message::Input {
                channel: 3,
                timestamp: -1,
                rtio_counter: 500,
                data: 1,
            }
        );
        assert!(message.time() < 0);
    }

    #[test]
    fn test_decode_exception_message() {
        let record = exception_record(7, 1234, ExceptionType::OUnderflow.code());
        let message = decode_message(&record).unwrap();
        assert_eq!(
            message,
            Message::Exception {
                channel: 7,
                rtio_counter: 1234,
                exception_type: ExceptionType::OUnderflow,
            }
        );
        assert_eq!(message.time(), 1234);
    }

    #[test]
    fn test_unknown_exception_code_fails() {
        let record = exception_record(7, 1234, 0x3f);
        assert!(decode_message(&record).is_err());
    }

    #[test]
    fn test_decode_dump() {
        let dump_data = dump_bytes(
            30,
            true,
            &[
                output_record(1, 100, 90, 0, 1),
                input_record(2, 150, 150, 0),
                stopped_record(200),
            ],
        );
        let dump = decode_dump(&dump_data).unwrap();
        assert_eq!(dump.log_channel, 30);
        assert!(dump.dds_onehot_sel);
        assert_eq!(dump.messages.len(), 3);
        assert_eq!(dump.messages[2], Message::Stopped { rtio_counter: 200 });
    }

    #[test]
    fn test_decode_dump_little_endian_header() {
        let mut dump_data = dump_bytes(5, false, &[stopped_record(1)]);
        // Rewrite the header fields little-endian; records stay big-endian.
        dump_data[0] = b'e';
        dump_data[1..5].copy_from_slice(&32u32.to_le_bytes());
        dump_data[5..13].copy_from_slice(&32u64.to_le_bytes());
        let dump = decode_dump(&dump_data).unwrap();
        assert_eq!(dump.log_channel, 5);
        assert_eq!(dump.messages, vec![Message::Stopped { rtio_counter: 1 }]);
    }

    #[test]
    fn test_record_count_matches_sent_bytes() {
        let records: Vec<_> = (0..17).map(|n| output_record(n, n as u64, 0, 0, 0)).collect();
        let dump_data = dump_bytes(0, false, &records);
        let dump = decode_dump(&dump_data).unwrap();
        // sent_bytes / 32 records exactly.
        assert_eq!(dump.messages.len(), (dump_data.len() - 16) / 32);
    }

    #[test]
    fn test_decode_dump_is_idempotent() {
        let dump_data = dump_bytes(
            9,
            false,
            &[
                output_record(1, 100, 90, 0, 1),
                exception_record(1, 110, ExceptionType::OUnderflow.code()),
                stopped_record(120),
            ],
        );
        let first = decode_dump(&dump_data).unwrap();
        let second = decode_dump(&dump_data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_length_mismatch_is_fatal() {
        let mut dump_data = dump_bytes(0, false, &[stopped_record(1)]);
        // Truncated record data.
        dump_data.pop();
        assert!(decode_dump(&dump_data).is_err());

        // Trailing garbage.
        let mut dump_data = dump_bytes(0, false, &[stopped_record(1)]);
        dump_data.push(0);
        assert!(decode_dump(&dump_data).is_err());

        // Header claims more than was sent.
        let mut dump_data = dump_bytes(0, false, &[stopped_record(1)]);
        dump_data[1..5].copy_from_slice(&64u32.to_be_bytes());
        assert!(decode_dump(&dump_data).is_err());
    }

    #[test]
    fn test_unknown_endianness_byte_fails() {
        let mut dump_data = dump_bytes(0, false, &[]);
        dump_data[0] = b'x';
        assert!(decode_dump(&dump_data).is_err());
    }
}
