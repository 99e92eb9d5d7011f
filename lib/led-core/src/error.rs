//! Error taxonomy beyond the wire codec's own [`led_wire::WireError`]
//! (spec §7). All of these are handled locally — logged, counted, and
//! turned into a nack where one is owed — except [`ConfigError`], which is
//! fatal at startup.

use std::fmt;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum StateError {
    NotAdopted,
    AlreadyAdopted,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::NotAdopted => write!(f, "node is not adopted"),
            StateError::AlreadyAdopted => write!(f, "node is already adopted"),
        }
    }
}

impl std::error::Error for StateError {}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ResourceError {
    NoMem,
    PeripheralIo,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NoMem => write!(f, "framebuffer allocator out of memory"),
            ResourceError::PeripheralIo => write!(f, "peripheral i/o failure"),
        }
    }
}

impl std::error::Error for ResourceError {}

#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingSection(String),
    BadAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingSection(name) => write!(f, "missing configuration section '{name}'"),
            ConfigError::BadAddress(addr) => write!(f, "couldn't parse address '{addr}'"),
        }
    }
}

impl std::error::Error for ConfigError {}
