use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use sense_rs::{ApiMode, BluetoothConnector, ScientisstTransport, Session};

#[derive(Parser, Debug)]
#[command(name = "sense-demo", about = "Connect to a Sense device and read frames")]
struct Args {
    /// Bluetooth MAC address of an already-paired device (e.g. 20:16:10:XX:XX:XX)
    mac: String,
    /// Sampling rate in Hz
    #[arg(long, default_value_t = 1000)]
    rate: u16,
    /// Analog channels to acquire (1-6 internal, 7-8 external); empty means all
    #[arg(long, value_delimiter = ',')]
    channels: Vec<u8>,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    println!("--- Connecting to Sense device {} ---", args.mac);
    let connector = BluetoothConnector::default();
    let stream = connector
        .connect(&args.mac)
        .with_context(|| format!("connecting to {}", args.mac))?;

    let mut session = Session::new(&args.mac)?;
    let transport = ScientisstTransport::spawn(stream, || {
        log::warn!("transport disconnected");
    })
    .context("spawning transport")?;
    session.connect_transport(Box::new(transport))?;

    println!("Connected! Reading version...");
    match session.version() {
        Ok(v) => println!("Version: {}", v.trim()),
        Err(e) => println!("Version: unknown ({e})"),
    }

    println!("Starting acquisition at {}Hz...", args.rate);
    session.start(args.rate, &args.channels, false, ApiMode::Scientisst)?;

    println!("Reading 10 batches of 100 frames...");
    for i in 0..10 {
        match session.read(100) {
            Ok(frames) => {
                if let Some(first) = frames.first() {
                    println!("[batch {i}] seq={:02} digital={:?}", first.seq, first.digital);
                }
            }
            Err(e) => eprintln!("read error: {e}"),
        }
        thread::sleep(Duration::from_millis(10));
    }

    println!("Stopping...");
    session.stop()?;
    println!("Done.");
    Ok(())
}
