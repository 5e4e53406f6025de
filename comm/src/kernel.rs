//! Kernel management connection to a core device: handshake, kernel
//! load/run, and the serve loop answering RPCs until the kernel finishes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, ensure, Context, Result};
use byteorder::ReadBytesExt;
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::embedding::EmbeddingMap;
use crate::value::{decode_rpc_args, send_rpc_value, Endianness, TagCursor, Value};
use crate::version::incompatible_versions;

pub const MAGIC: &[u8] = b"ARTIQ coredev\n";

const HEADER_SYNC_BYTE: u8 = 0x5a;
const WRITE_BUFFER_FLUSH_THRESHOLD: usize = 4096;
const MAX_EXCEPTION_MESSAGE: usize = 4096;

#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum Request {
    SystemInfo = 3,
    LoadKernel = 5,
    RunKernel = 6,
    RpcReply = 7,
    RpcException = 8,
    SubkernelUpload = 9,
}

#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum Reply {
    SystemInfo = 2,
    LoadCompleted = 5,
    LoadFailed = 6,
    KernelFinished = 7,
    KernelStartupFailed = 8,
    KernelException = 9,
    RpcRequest = 10,
    ClockFailure = 15,
}

#[derive(Debug, Error)]
#[error("core device refused the kernel library: {0}")]
pub struct LoadError(pub String);

/// The RTIO PLL lost lock. Nothing further can be done on this connection.
#[derive(Debug, Error)]
#[error("RTIO clock failure")]
pub struct ClockFailure;

/// Failure raised by a host RPC service, forwarded to the kernel so it can
/// unwind.
#[derive(Debug, Error)]
#[error("{name}: {message}")]
pub struct HostException {
    /// A `"0:Name"` name selects a builtin exception type on the kernel
    /// side; any other name is embedded as an opaque object.
    pub name: String,
    pub message: String,
    pub params: [i64; 3],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteException {
    pub name: String,
    pub message: String,
    pub params: [i64; 3],
    pub filename: String,
    pub line: i32,
    pub column: i32,
    pub function: String,
}

/// An exception that terminated the kernel, with the symbolized remote
/// backtrace.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelException {
    pub exceptions: Vec<RemoteException>,
    /// Per-exception (stack pointer, initial backtrace, current backtrace).
    pub unwind: Vec<(i64, i64, i64)>,
    pub traceback: Vec<String>,
    pub stack_pointers: Vec<i64>,
}

impl fmt::Display for KernelException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Core Device Traceback:")?;
        for frame in &self.traceback {
            writeln!(f, "  {frame}")?;
        }
        for exception in &self.exceptions {
            writeln!(
                f,
                "{}({}) at {}:{}:{} in {}",
                exception.name,
                exception.message,
                exception.filename,
                exception.line,
                exception.column,
                exception.function,
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for KernelException {}

/// Host-side RPC service table consulted by [`CommKernel::serve`].
pub trait RpcDispatcher {
    fn dispatch(
        &mut self,
        service: u32,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, HostException>;
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_EXCEPTION_MESSAGE {
        return message.to_string();
    }
    let mut end = MAX_EXCEPTION_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &message[..end])
}

static VERSION_WARNED: AtomicBool = AtomicBool::new(false);

pub struct CommKernel<S> {
    stream: S,
    endianness: Endianness,
    write_buffer: Vec<u8>,
}

impl<S: Read + Write> CommKernel<S> {
    /// Perform the handshake on a fresh connection. The byte the device
    /// answers with fixes the session byte order.
    pub fn open(mut stream: S) -> Result<CommKernel<S>> {
        stream.write_all(MAGIC)?;
        stream.flush()?;
        let endianness = Endianness::from_tag(stream.read_u8()?)?;
        debug!("connected, {endianness:?}-endian session");
        Ok(CommKernel {
            stream,
            endianness,
            write_buffer: Vec::new(),
        })
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn write_header(&mut self, request: Request) -> Result<()> {
        self.write_buffer.extend_from_slice(&[HEADER_SYNC_BYTE; 4]);
        self.write_buffer.push(request as u8);
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.write_buffer.len() > WRITE_BUFFER_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.write_buffer.is_empty() {
            self.stream.write_all(&self.write_buffer)?;
            self.write_buffer.clear();
        }
        self.stream.flush()?;
        Ok(())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_buffer.push(value);
        self.maybe_flush()
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.endianness.write_u32(&mut self.write_buffer, value)?;
        self.maybe_flush()
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.endianness.write_i32(&mut self.write_buffer, value)?;
        self.maybe_flush()
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.endianness.write_i64(&mut self.write_buffer, value)?;
        self.maybe_flush()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32(u32::try_from(bytes.len()).context("payload too long")?)?;
        self.write_buffer.extend_from_slice(bytes);
        self.maybe_flush()
    }

    /// Hunt for four consecutive sync bytes, then read the reply type.
    fn read_header(&mut self) -> Result<Reply> {
        self.flush()?;
        let mut sync_count = 0;
        while sync_count < 4 {
            if self.stream.read_u8()? == HEADER_SYNC_BYTE {
                sync_count += 1;
            } else {
                sync_count = 0;
            }
        }
        let byte = self.stream.read_u8()?;
        Reply::from_u8(byte).with_context(|| format!("unknown reply type {byte}"))
    }

    fn read_expect(&mut self, expected: Reply) -> Result<()> {
        let reply = self.read_header()?;
        ensure!(
            reply == expected,
            "incorrect reply from device: {reply:?} (expected {expected:?})"
        );
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.stream.read_u8()? != 0)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(self.endianness.read_u32(&mut self.stream)?)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.endianness.read_i32(&mut self.stream)?)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.endianness.read_i64(&mut self.stream)?)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_u32()? as usize;
        let mut bytes = vec![0u8; length];
        self.stream.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?).context("string is not valid UTF-8")
    }

    /// Verify the runtime identifier and warn (once per process) about a
    /// version mismatch with the host software.
    pub fn check_system_info(&mut self, software_version: &str) -> Result<()> {
        self.write_header(Request::SystemInfo)?;
        self.read_expect(Reply::SystemInfo)?;

        let mut runtime_id = [0u8; 4];
        self.stream.read_exact(&mut runtime_id)?;
        if &runtime_id != b"AROR" {
            bail!("unsupported runtime id {runtime_id:?}");
        }
        let runtime_version = self.read_string()?;
        // Everything after the first semicolon is build metadata.
        let runtime_version = runtime_version.split(';').next().unwrap_or("").trim();
        if incompatible_versions(runtime_version, software_version)
            && !VERSION_WARNED.swap(true, Ordering::Relaxed)
        {
            warn!(
                "mismatch between core device runtime ({runtime_version}) \
                 and host software ({software_version}) versions"
            );
        }
        Ok(())
    }

    pub fn load(&mut self, library: &[u8]) -> Result<()> {
        self.write_header(Request::LoadKernel)?;
        self.write_bytes(library)?;
        self.load_reply()
    }

    pub fn upload_subkernel(&mut self, library: &[u8], id: u32, destination: u8) -> Result<()> {
        self.write_header(Request::SubkernelUpload)?;
        self.write_u32(id)?;
        self.write_u8(destination)?;
        self.write_bytes(library)?;
        self.load_reply()
    }

    fn load_reply(&mut self) -> Result<()> {
        match self.read_header()? {
            Reply::LoadCompleted => Ok(()),
            Reply::LoadFailed => Err(LoadError(self.read_string()?).into()),
            other => bail!("incorrect reply from device: {other:?}"),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        self.write_header(Request::RunKernel)?;
        self.flush()
    }

    /// Answer the kernel's requests until it finishes or fails.
    pub fn serve(
        &mut self,
        embedding_map: &mut EmbeddingMap,
        dispatcher: &mut dyn RpcDispatcher,
        symbolizer: &dyn Fn(&[u64]) -> Vec<String>,
        demangler: &dyn Fn(Vec<String>) -> Vec<String>,
    ) -> Result<()> {
        loop {
            match self.read_header()? {
                Reply::RpcRequest => self.serve_rpc(embedding_map, dispatcher)?,
                Reply::KernelException => {
                    return Err(self
                        .read_kernel_exception(embedding_map, symbolizer, demangler)?
                        .into());
                }
                Reply::KernelFinished => {
                    self.process_async_errors()?;
                    return Ok(());
                }
                Reply::KernelStartupFailed => bail!("kernel startup failed"),
                Reply::ClockFailure => return Err(ClockFailure.into()),
                other => bail!("unexpected reply during kernel execution: {other:?}"),
            }
        }
    }

    fn serve_rpc(
        &mut self,
        embedding_map: &mut EmbeddingMap,
        dispatcher: &mut dyn RpcDispatcher,
    ) -> Result<()> {
        let is_async = self.read_bool()?;
        let service = self.read_u32()?;
        let (args, kwargs) = decode_rpc_args(&mut self.stream, self.endianness)?;
        let return_tags = self.read_bytes()?;
        debug!("RPC service {service} (async={is_async})");

        if is_async {
            if let Err(exception) = dispatcher.dispatch(service, args, kwargs) {
                warn!("uncaught exception in async RPC service {service}: {exception}");
            }
            return Ok(());
        }

        match dispatcher.dispatch(service, args, kwargs) {
            Ok(result) => {
                let rollback = self.write_buffer.len();
                self.write_header(Request::RpcReply)?;
                self.write_bytes(&return_tags)?;
                let mut tags = TagCursor::new(&return_tags);
                // A value the expected type cannot carry must never reach
                // the wire: drop the half-written reply and fail the serve.
                if let Err(error) =
                    send_rpc_value(&mut self.write_buffer, self.endianness, &mut tags, &result)
                {
                    self.write_buffer.truncate(rollback);
                    return Err(error);
                }
                self.flush()
            }
            Err(exception) => self.write_rpc_exception(embedding_map, &exception),
        }
    }

    fn write_rpc_exception(
        &mut self,
        embedding_map: &mut EmbeddingMap,
        exception: &HostException,
    ) -> Result<()> {
        debug!("forwarding host exception to kernel: {exception}");
        self.write_header(Request::RpcException)?;
        let name_id = if exception.name.starts_with("0:") {
            embedding_map.store_str(&exception.name)
        } else {
            embedding_map.store_object(Box::new(exception.name.clone()))
        };
        self.write_u32(name_id)?;
        let message_id = embedding_map.store_str(&truncate_message(&exception.message));
        self.write_u32(message_id)?;
        for param in exception.params {
            self.write_i64(param)?;
        }
        // One synthesized host frame.
        let filename_id = embedding_map.store_str("<host>");
        self.write_u32(filename_id)?;
        self.write_i32(0)?;
        self.write_i32(-1)?;
        let function_id = embedding_map.store_str("rpc");
        self.write_u32(function_id)?;
        self.flush()
    }

    /// A string that is either inline or a reference into the embedding map.
    fn read_exception_string(&mut self, embedding_map: &EmbeddingMap) -> Result<String> {
        let id = self.read_i32()?;
        if id == -1 {
            self.read_string()
        } else {
            embedding_map
                .retrieve_str(id as u32)
                .map(str::to_string)
                .with_context(|| format!("unknown embedded string id {id}"))
        }
    }

    fn read_kernel_exception(
        &mut self,
        embedding_map: &EmbeddingMap,
        symbolizer: &dyn Fn(&[u64]) -> Vec<String>,
        demangler: &dyn Fn(Vec<String>) -> Vec<String>,
    ) -> Result<KernelException> {
        let count = self.read_u32()? as usize;
        let mut exceptions = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.read_exception_string(embedding_map)?;
            let message = self.read_exception_string(embedding_map)?;
            let params = [self.read_i64()?, self.read_i64()?, self.read_i64()?];
            let filename = self.read_exception_string(embedding_map)?;
            let line = self.read_i32()?;
            let column = self.read_i32()?;
            let function = self.read_exception_string(embedding_map)?;
            exceptions.push(RemoteException {
                name,
                message,
                params,
                filename,
                line,
                column,
                function,
            });
        }

        // Function names are mangled; demangle them in one batch.
        let functions = exceptions.iter().map(|e| e.function.clone()).collect();
        for (exception, function) in exceptions.iter_mut().zip(demangler(functions)) {
            exception.function = function;
        }

        let mut unwind = Vec::with_capacity(count);
        for _ in 0..count {
            unwind.push((self.read_i64()?, self.read_i64()?, self.read_i64()?));
        }

        let frame_count = self.read_u32()? as usize;
        let mut addresses = Vec::with_capacity(frame_count);
        let mut stack_pointers = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            addresses.push(self.read_i64()? as u64);
            stack_pointers.push(self.read_i64()?);
        }
        self.process_async_errors()?;

        Ok(KernelException {
            exceptions,
            unwind,
            traceback: symbolizer(&addresses),
            stack_pointers,
        })
    }

    fn process_async_errors(&mut self) -> Result<()> {
        let errors = self.stream.read_u8()?;
        if errors != 0 {
            let mut names = Vec::new();
            if errors & 1 != 0 {
                names.push("collision(s)");
            }
            if errors & 2 != 0 {
                names.push("busy error(s)");
            }
            if errors & 4 != 0 {
                names.push("sequence error(s)");
            }
            warn!(
                "RTIO {} reported during kernel execution",
                names.join(" and ")
            );
        }
        Ok(())
    }
}
