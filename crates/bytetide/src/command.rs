//! Text commands read by the node binary, one per line.
//!
//! ```text
//! CONNECT <ip:port>
//! DISCONNECT <ip:port>
//! ADDPACKAGE <manifest path>
//! REMPACKAGE <identifier, at least 20 characters>
//! PACKAGES
//! PEERS
//! FETCH <ip:port> <identifier> [<hash> [<offset> [<size>]]]
//! QUIT
//! ```
use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use crate::{error::Error, hash::HexHash, store::IDENT_PREFIX_MIN};

pub const INVALID_INPUT: &str = "Invalid Input";
pub const MISSING_ADDRESS: &str = "Missing address and port argument";
pub const MISSING_FILE: &str = "Missing file argument";
pub const MISSING_IDENT: &str = "Missing identifier argument, please specify \
                                 whole 1024 character or at least 20 characters.";
pub const MISSING_FETCH_ARGS: &str = "Missing arguments from command";
pub const CHUNK_NOT_IN_PACKAGE: &str =
    "Unable to request chunk, chunk hash does not belong to package";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    AddPackage(PathBuf),
    RemovePackage(String),
    Packages,
    Peers,
    Fetch(Fetch),
    Quit,
}

/// What to request from a peer.
///
/// Without a hash every chunk that is not complete locally is requested.
/// A chunk hash requests that chunk, optionally narrowed to a sub-range.
/// An internal node hash requests every chunk beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    pub addr: SocketAddr,
    pub ident: String,
    pub hash: Option<HexHash>,
    pub offset: Option<u32>,
    pub size: Option<u32>,
}

fn invalid(msg: &str) -> Error {
    Error::InvalidCommand(msg.to_owned())
}

fn address(args: &[&str]) -> Result<SocketAddr, Error> {
    match args {
        [addr] => addr.parse().map_err(|_| invalid(MISSING_ADDRESS)),
        _ => Err(invalid(MISSING_ADDRESS)),
    }
}

fn fetch(args: &[&str]) -> Result<Command, Error> {
    let missing = || invalid(MISSING_FETCH_ARGS);

    let [addr, ident, rest @ ..] = args else {
        return Err(missing());
    };
    if rest.len() > 3 {
        return Err(missing());
    }

    let addr = addr.parse().map_err(|_| missing())?;
    let hash = rest
        .first()
        .map(|h| h.parse::<HexHash>())
        .transpose()
        .map_err(|_| invalid(CHUNK_NOT_IN_PACKAGE))?;
    let number = |i: usize| -> Result<Option<u32>, Error> {
        rest.get(i).map(|n| n.parse()).transpose().map_err(|_| missing())
    };

    Ok(Command::Fetch(Fetch {
        addr,
        ident: ident.to_string(),
        hash,
        offset: number(1)?,
        size: number(2)?,
    }))
}

impl FromStr for Command {
    type Err = Error;

    /// Parse one line. The error carries the text to show the user.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);

        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, Some(rest)),
            None => (line, None),
        };

        // arguments are separated from the command by exactly one space
        let args: Vec<&str> = match rest {
            Some(rest) if rest.is_empty() || rest.starts_with(' ') => {
                return Err(invalid(INVALID_INPUT))
            }
            Some(rest) => rest.split_whitespace().collect(),
            None => vec![],
        };

        match (word, rest.is_some()) {
            ("QUIT", false) => Ok(Command::Quit),
            ("PACKAGES", false) => Ok(Command::Packages),
            ("PEERS", false) => Ok(Command::Peers),
            ("CONNECT", true) => Ok(Command::Connect(address(&args)?)),
            ("DISCONNECT", true) => Ok(Command::Disconnect(address(&args)?)),
            ("ADDPACKAGE", true) => match args[..] {
                [file] => Ok(Command::AddPackage(file.into())),
                _ => Err(invalid(MISSING_FILE)),
            },
            ("REMPACKAGE", true) => match args[..] {
                [ident] if ident.len() >= IDENT_PREFIX_MIN => {
                    Ok(Command::RemovePackage(ident.to_owned()))
                }
                _ => Err(invalid(MISSING_IDENT)),
            },
            ("FETCH", true) => fetch(&args),
            _ => Err(invalid(INVALID_INPUT)),
        }
    }
}
