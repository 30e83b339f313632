use core::fmt;

/// Ways a block device operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Sector index past the end of the device.
    SectorOutOfBounds,
    /// Buffer length is not exactly one sector.
    BufferInvalid,
    /// The driver could not read the sector.
    ReadError,
    /// The driver could not write the sector.
    WriteError,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::SectorOutOfBounds => write!(f, "sector out of bounds"),
            BlockError::BufferInvalid => write!(f, "buffer is not one sector long"),
            BlockError::ReadError => write!(f, "block device read failed"),
            BlockError::WriteError => write!(f, "block device write failed"),
        }
    }
}

impl core::error::Error for BlockError {}
