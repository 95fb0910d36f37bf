// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
use sha2::{Digest, Sha256};
use std::io::{Result, Write};

/// Wraps a writer and calculates the sha256 digest of data written to the inner writer
pub(crate) struct Sha256Writer<W> {
    writer: W,
    sha: Sha256,
}

impl<W> Sha256Writer<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            sha: Sha256::new(),
        }
    }

    /// Return the hex encoded sha256 digest of the written data, and the underlying writer
    pub(crate) fn finish(self) -> (String, W) {
        (hex::encode(self.sha.finalize()), self.writer)
    }
}

impl<W> Write for Sha256Writer<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let len = self.writer.write(buf)?;
        self.sha.update(&buf[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

/// Hex sha256 of an in-memory buffer.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex sha256 of everything `reader` yields.
pub(crate) fn sha256_hex_of(reader: &mut impl std::io::Read) -> Result<String> {
    let mut writer = Sha256Writer::new(std::io::sink());
    std::io::copy(reader, &mut writer)?;
    Ok(writer.finish().0)
}
