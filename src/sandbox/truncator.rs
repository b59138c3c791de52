use std::io::{self, Read, Seek, SeekFrom, Write};

/// Read-only view that behaves as if the wrapped stream were only its first
/// `limit` bytes long
///
/// Seeking relative to the end uses the truncated length. The underlying
/// stream is never modified and writes are rejected.
pub struct Truncator<R> {
    inner: R,
    limit: u64,
    pos: u64,
}

impl<R: Read + Seek> Truncator<R> {
    pub fn new(mut inner: R, limit: u64) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        Ok(Self { inner, limit, pos })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for Truncator<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.limit {
            return Ok(0);
        }
        let remaining = (self.limit - self.pos).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..remaining])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for Truncator<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let real_end = self.inner.seek(SeekFrom::End(0))?;
                real_end.min(self.limit).checked_add_signed(delta)
            }
        };
        let Some(target) = target else {
            // Restore the inner position, which SeekFrom::End may have moved.
            self.inner.seek(SeekFrom::Start(self.pos))?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            ));
        };
        self.pos = self.inner.seek(SeekFrom::Start(target))?;
        Ok(self.pos)
    }
}

impl<R> Write for Truncator<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "truncated views are read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
