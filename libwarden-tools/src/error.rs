use nom::error::ErrorKind;
use pcap_parser::PcapError;
use std::convert::From;
use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    Generic(&'static str),
    Nom(ErrorKind),
    IoError(io::Error),
    Pcap(PcapError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Generic(s) => write!(f, "{}", s),
            Error::Nom(e) => write!(f, "parse error: {:?}", e),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::Pcap(e) => write!(f, "pcap error: {:?}", e),
        }
    }
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Generic(s)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<ErrorKind> for Error {
    fn from(e: ErrorKind) -> Self {
        Error::Nom(e)
    }
}

impl From<PcapError> for Error {
    fn from(e: PcapError) -> Self {
        Error::Pcap(e)
    }
}
