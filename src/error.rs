use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
/// A custom Syzygy error
#[non_exhaustive]
pub enum Error {
    /// The image or debug-data bytes are insufficient or unreadable
    IO(io::Error),
    /// An error emitted by scroll while plumbing bytes
    Scroll(scroll::Error),
    /// An invalid magic or version number was encountered
    BadMagic(u64),
    /// The entity is malformed in some way that a parser noticed
    Malformed(String),
    /// Debug data contradicts the image, e.g. fixups that disagree with
    /// relocations or references that disagree with each other
    Consistency(String),
    /// Disassembly failed in a block that is expected to be clean, or a
    /// reference landed outside every section
    Decomposition(String),
    /// A placement collided or a layout fixpoint failed to converge
    Layout(String),
    /// A transform failed or violated its post-conditions
    Transform(String),
    /// A serialized block-graph stream could not be read back
    Serialization(String),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IO(ref io) => Some(io),
            Error::Scroll(ref scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::IO(ref err) => write!(fmt, "{err}"),
            Error::Scroll(ref err) => write!(fmt, "{err}"),
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{magic:x}"),
            Error::Malformed(ref msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::Consistency(ref msg) => write!(fmt, "Inconsistent image: {msg}"),
            Error::Decomposition(ref msg) => write!(fmt, "Decomposition failed: {msg}"),
            Error::Layout(ref msg) => write!(fmt, "Layout failed: {msg}"),
            Error::Transform(ref msg) => write!(fmt, "Transform failed: {msg}"),
            Error::Serialization(ref msg) => write!(fmt, "Serialization failed: {msg}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
