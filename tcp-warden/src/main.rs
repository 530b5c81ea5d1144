#[macro_use]
extern crate log;

use clap::{crate_version, App, Arg};

use std::fs::File;
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use libtcp_warden::TcpWarden;
use libwarden_tools::{Config, PcapEngine};

fn load_config(config: &mut Config, filename: &str) -> Result<(), io::Error> {
    debug!("Loading configuration {}", filename);
    let path = Path::new(&filename);
    let file = File::open(path)?;
    config.load_config(file)
}

fn main() -> io::Result<()> {
    let matches = App::new("TCP warden")
        .version(crate_version!())
        .about("Passive detection of TCP handshake hijack and segment injection attacks")
        .arg(
            Arg::with_name("verbose")
                .help("Be verbose")
                .short("v")
                .long("verbose"),
        )
        .arg(
            Arg::with_name("config")
                .help("Configuration file")
                .short("c")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("output-dir")
                .help("Directory for attack reports and packet logs")
                .short("o")
                .long("output-dir")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-packets")
                .help("Write every packet of each connection to a per-flow pcap file")
                .short("l")
                .long("log-packets"),
        )
        .arg(
            Arg::with_name("INPUT")
                .help("Input file name")
                .required(true)
                .index(1),
        )
        .get_matches();

    env_logger::init();

    debug!("TCP warden {}", crate_version!());

    let mut config = Config::default();
    if let Some(filename) = matches.value_of("config") {
        load_config(&mut config, filename)?;
    }
    if let Some(dir) = matches.value_of("output-dir") {
        let _ = config.set("output_dir", dir);
    }
    if matches.is_present("log-packets") {
        let _ = config.set("log_packets", true);
    }

    let warden = TcpWarden::new(&config);
    let mut engine = PcapEngine::new(Box::new(warden), &config);

    let input_filename = matches.value_of("INPUT").unwrap();

    let mut input_reader = if input_filename == "-" {
        Box::new(io::stdin()) as Box<dyn io::Read>
    } else {
        let path = Path::new(&input_filename);
        let file = File::open(path)?;
        if input_filename.ends_with(".gz") {
            Box::new(GzDecoder::new(file)) as Box<dyn io::Read>
        } else if input_filename.ends_with(".xz") {
            Box::new(XzDecoder::new(file)) as Box<dyn io::Read>
        } else if input_filename.ends_with(".lz4") {
            Box::new(lz4::Decoder::new(file)?) as Box<dyn io::Read>
        } else {
            Box::new(file)
        }
    };

    engine.run(&mut input_reader).expect("run analyzer");

    Ok(())
}
