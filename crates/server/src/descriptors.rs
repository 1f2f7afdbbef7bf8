//! Parsing the bridge authority's extra-info documents.
//!
//! The subset we care about looks like this:
//!
//! ```text
//! extra-info NickName 0123456789ABCDEF0123456789ABCDEF01234567
//! transport obfs4 1.2.3.4:443 cert=abc,iat-mode=0
//! ```
//!
//! An `extra-info` line starts a bridge block and binds a fingerprint; each
//! following `transport` line emits one transport resource for it.

use ferry_core::Transport;
use std::net::IpAddr;
use thiserror::Error;

const EXTRA_INFO_PREFIX: &str = "extra-info";
const TRANSPORT_PREFIX: &str = "transport";
const MIN_TRANSPORT_WORDS: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("incorrect number of words in 'extra-info' line")]
    MalformedExtraInfo,
    #[error("not enough arguments in 'transport' line")]
    MalformedTransport,
    #[error("key=value pair in `{0}` not separated by a single '='")]
    MalformedParams(String),
    #[error("malformed address or port `{0}`")]
    MalformedAddress(String),
}

/// Parses an extra-info document into the transports it describes.  Any
/// malformed line fails the whole document.
pub fn parse_extrainfo(doc: &str) -> Result<Vec<Transport>, DescriptorError> {
    let mut fingerprint = String::new();
    let mut transports = Vec::new();

    for line in doc.lines() {
        let line = line.trim();
        if line.starts_with(EXTRA_INFO_PREFIX) {
            let words: Vec<&str> = line.split(' ').collect();
            if words.len() != 3 {
                return Err(DescriptorError::MalformedExtraInfo);
            }
            fingerprint = words[2].to_string();
        }
        if line.starts_with(TRANSPORT_PREFIX) {
            transports.push(parse_transport_line(line, &fingerprint)?);
        }
    }

    Ok(transports)
}

/// Parses a single line of the format
/// `"transport" transport-name address:port [arglist]`.
fn parse_transport_line(line: &str, fingerprint: &str) -> Result<Transport, DescriptorError> {
    let words: Vec<&str> = line.split(' ').collect();
    if words.len() < MIN_TRANSPORT_WORDS {
        return Err(DescriptorError::MalformedTransport);
    }

    let mut transport = Transport::new(words[1]);
    transport.fingerprint = fingerprint.to_string();

    let (address, port) = split_host_port(words[2])?;
    transport.address = address;
    transport.port = port;

    // There may be one or more key=value pairs.
    if words.len() > MIN_TRANSPORT_WORDS {
        for arg in words[3].split(',') {
            let pieces: Vec<&str> = arg.split('=').collect();
            if pieces.len() != 2 {
                return Err(DescriptorError::MalformedParams(words[3].to_string()));
            }
            transport
                .params
                .insert(pieces[0].to_string(), pieces[1].to_string());
        }
    }

    Ok(transport)
}

/// Splits `host:port`, tolerating bracketed IPv6 addresses.
fn split_host_port(s: &str) -> Result<(IpAddr, u16), DescriptorError> {
    let malformed = || DescriptorError::MalformedAddress(s.to_string());

    let (host, port) = s.rsplit_once(':').ok_or_else(malformed)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let address = host.parse().map_err(|_| malformed())?;
    let port = port.parse().map_err(|_| malformed())?;
    Ok((address, port))
}
