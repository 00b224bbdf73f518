// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-size vector.
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for readers to read everything that remains, up to a limit.
pub trait ReadToEndLimitExt {
    /// Read until EOF. Fails with [`io::ErrorKind::InvalidData`] if more than
    /// `limit` bytes are available.
    fn read_to_end_limit(&mut self, limit: u64) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadToEndLimitExt for R {
    fn read_to_end_limit(&mut self, limit: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.take(limit.saturating_add(1)).read_to_end(&mut buf)?;

        if buf.len() as u64 > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Data exceeds limit of {limit} bytes"),
            ));
        }

        Ok(buf)
    }
}
