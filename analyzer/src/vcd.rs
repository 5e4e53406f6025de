//! Value Change Dump output sink.

use std::io::Write;

use anyhow::Result;
use typed_index_collections::TiVec;

use crate::sink::{ChannelKind, ChannelRef, Sink};

/// Identifier codes are a base-94 counter over the printable ASCII range
/// 33..=126, shortest codes first.
fn identifier_code(n: usize) -> String {
    const BASE: usize = 94;
    let (mut q, r) = (n / BASE, n % BASE);
    let mut code = vec![33 + r as u8];
    while q > 0 {
        let (next_q, r) = ((q - 1) / BASE, (q - 1) % BASE);
        code.insert(0, 33 + r as u8);
        q = next_q;
    }
    String::from_utf8(code).expect("codes are printable ASCII")
}

pub struct VcdWriter<W: Write> {
    out: W,
    /// Identifier code per declared channel.
    codes: TiVec<ChannelRef, String>,
    current_time: Option<i64>,
    start_time: i64,
}

impl<W: Write> VcdWriter<W> {
    pub fn new(out: W) -> Self {
        VcdWriter {
            out,
            codes: TiVec::new(),
            current_time: None,
            start_time: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_vector(&mut self, channel: ChannelRef, value: &str) -> Result<()> {
        if value.len() > 1 {
            writeln!(self.out, "b{} {}", value, self.codes[channel])?;
        } else {
            writeln!(self.out, "{}{}", value, self.codes[channel])?;
        }
        Ok(())
    }
}

impl<W: Write> Sink for VcdWriter<W> {
    fn get_channel(
        &mut self,
        name: &str,
        width: u32,
        _kind: ChannelKind,
        _precision: u32,
        _unit: &str,
    ) -> Result<ChannelRef> {
        let code = identifier_code(self.codes.len());
        writeln!(self.out, "$var wire {width} {code} {name} $end")?;
        Ok(self.codes.push_and_get_key(code))
    }

    fn push_scope(&mut self, scope: &str, name: &str) -> Result<()> {
        writeln!(self.out, "$scope module {scope}/{name} $end")?;
        Ok(())
    }

    fn pop_scope(&mut self) -> Result<()> {
        writeln!(self.out, "$upscope $end")?;
        Ok(())
    }

    fn set_timescale_ps(&mut self, timescale: u64) -> Result<()> {
        writeln!(self.out, "$timescale {timescale}ps $end")?;
        Ok(())
    }

    fn set_start_time(&mut self, time: i64) {
        self.start_time = time;
    }

    fn set_time(&mut self, time: i64) -> Result<()> {
        let time = time - self.start_time;
        // Successive events at one instant share a single #-line.
        if self.current_time != Some(time) {
            writeln!(self.out, "#{time}")?;
            self.current_time = Some(time);
        }
        Ok(())
    }

    fn set_value(&mut self, channel: ChannelRef, value: &str) -> Result<()> {
        self.write_vector(channel, value)
    }

    fn set_value_double(&mut self, channel: ChannelRef, value: f64) -> Result<()> {
        // Doubles are emitted as the 64-bit pattern of the value.
        let bits = value.to_bits();
        let formatted = format!("{bits:064b}");
        self.write_vector(channel, &formatted)
    }

    fn set_log(&mut self, channel: ChannelRef, message: &str) -> Result<()> {
        let mut value = String::with_capacity(message.len() * 8);
        for byte in message.bytes() {
            value.push_str(&format!("{byte:08b}"));
        }
        self.write_vector(channel, &value)
    }
}
