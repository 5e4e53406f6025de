//! Convert RTIO analyzer dumps to VCD waveform files.

use std::env;
use std::fs;
use std::io;
use std::process;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use analyzer::device::{parse_device_db, DeviceDb};
use analyzer::dump::decode_dump;
use analyzer::replay::{decoded_dump_to_vcd, get_channel_list};

const USAGE: &str = "\
usage: dumptool [options] <dump file>

Converts an RTIO analyzer dump to a VCD waveform file.

options:
    --device-db <file.json>   device database mapping channels to devices
    --output <file.vcd>       output file (default: stdout)
    --uniform-interval        use event indices as the time axis
    --channel-list            print the channels the device db maps, and exit
";

#[derive(Default)]
struct Options {
    dump_file: Option<String>,
    device_db: Option<String>,
    output: Option<String>,
    uniform_interval: bool,
    channel_list: bool,
}

fn parse_args() -> Result<Options> {
    let mut options = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--device-db" => {
                options.device_db = Some(args.next().context("--device-db needs a file")?);
            }
            "--output" => {
                options.output = Some(args.next().context("--output needs a file")?);
            }
            "--uniform-interval" => options.uniform_interval = true,
            "--channel-list" => options.channel_list = true,
            "--help" | "-h" => {
                print!("{USAGE}");
                process::exit(0);
            }
            _ if arg.starts_with('-') => bail!("unknown option {arg}\n{USAGE}"),
            _ => {
                if options.dump_file.is_some() {
                    bail!("more than one dump file given\n{USAGE}");
                }
                options.dump_file = Some(arg);
            }
        }
    }
    Ok(options)
}

fn load_device_db(path: Option<&str>) -> Result<DeviceDb> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            parse_device_db(&json)
        }
        None => {
            warn!("no device database given; only the rtio_slack channel will be reconstructed");
            Ok(DeviceDb::new())
        }
    }
}

fn run() -> Result<()> {
    let options = parse_args()?;
    let devices = load_device_db(options.device_db.as_deref())?;

    if options.channel_list {
        for (name, signature) in get_channel_list(&devices)? {
            println!("{name} ({:?}, {} bits)", signature.kind, signature.width);
        }
        return Ok(());
    }

    let dump_file = options.dump_file.with_context(|| format!("no dump file given\n{USAGE}"))?;
    let raw = fs::read(&dump_file).with_context(|| format!("reading {dump_file}"))?;
    let dump = decode_dump(&raw)?;
    info!("decoded {} messages", dump.messages.len());

    match options.output {
        Some(path) => {
            let file = fs::File::create(&path).with_context(|| format!("creating {path}"))?;
            decoded_dump_to_vcd(
                io::BufWriter::new(file),
                &devices,
                &dump,
                options.uniform_interval,
            )?;
        }
        None => {
            decoded_dump_to_vcd(
                io::stdout().lock(),
                &devices,
                &dump,
                options.uniform_interval,
            )?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        process::exit(1);
    }
}
