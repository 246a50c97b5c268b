use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("can't skip {wanted} bytes in buffer of {len} bytes")]
    Skip { wanted: usize, len: usize },
    #[error("buffer is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BufferResult<T> = Result<T, BufferError>;

/// A FIFO byte buffer that keeps its contents in memory up to a threshold
/// and transparently spills the tail to an unnamed tempfile past it.
/// Appends go to the tail while the consumer reads from the head; the
/// consumer never learns whether data came from memory or disk.
pub struct OverflowBuffer {
    overflow: usize,
    mem: Vec<u8>,
    /// Consumed prefix of `mem`.
    mem_pos: usize,
    spill: Option<File>,
    spill_read: u64,
    spill_write: u64,
    closed: bool,
}

impl OverflowBuffer {
    pub fn new(overflow: usize) -> Self {
        OverflowBuffer {
            overflow,
            mem: Vec::new(),
            mem_pos: 0,
            spill: None,
            spill_read: 0,
            spill_write: 0,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        (self.mem.len() - self.mem_pos) + (self.spill_write - self.spill_read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, data: &[u8]) -> BufferResult<()> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        if let Some(file) = self.spill.as_mut() {
            file.seek(SeekFrom::Start(self.spill_write))?;
            file.write_all(data)?;
            self.spill_write += data.len() as u64;
            return Ok(());
        }
        if self.mem.len() - self.mem_pos + data.len() > self.overflow {
            // Start spilling; the in-memory prefix stays where it is and
            // keeps being consumed first.
            let mut file = tempfile::tempfile()?;
            file.write_all(data)?;
            self.spill_write = data.len() as u64;
            self.spill_read = 0;
            self.spill = Some(file);
        } else {
            self.mem.extend_from_slice(data);
        }
        Ok(())
    }

    /// Returns up to `n` bytes from the head without consuming them.
    pub fn get(&mut self, n: usize) -> BufferResult<Vec<u8>> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        let mut out = Vec::with_capacity(n.min(self.len()));
        let from_mem = (self.mem.len() - self.mem_pos).min(n);
        out.extend_from_slice(&self.mem[self.mem_pos..self.mem_pos + from_mem]);
        let mut want = n - from_mem;
        if want > 0 {
            if let Some(file) = self.spill.as_mut() {
                let avail = (self.spill_write - self.spill_read) as usize;
                want = want.min(avail);
                if want > 0 {
                    file.seek(SeekFrom::Start(self.spill_read))?;
                    let mut tmp = vec![0u8; want];
                    file.read_exact(&mut tmp)?;
                    out.extend_from_slice(&tmp);
                }
            }
        }
        Ok(out)
    }

    /// Returns the whole remaining content without consuming it.
    pub fn get_all(&mut self) -> BufferResult<Vec<u8>> {
        let len = self.len();
        self.get(len)
    }

    /// Consumes `n` bytes from the head.
    pub fn skip(&mut self, n: usize) -> BufferResult<()> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        let len = self.len();
        if n > len {
            return Err(BufferError::Skip { wanted: n, len });
        }
        let from_mem = (self.mem.len() - self.mem_pos).min(n);
        self.mem_pos += from_mem;
        if self.mem_pos == self.mem.len() {
            self.mem.clear();
            self.mem_pos = 0;
        }
        let rest = (n - from_mem) as u64;
        self.spill_read += rest;
        if self.spill_read == self.spill_write {
            // Fully drained; release the file so small buffers go back to
            // living in memory.
            self.spill = None;
            self.spill_read = 0;
            self.spill_write = 0;
        }
        Ok(())
    }

    /// Consuming read of up to `n` bytes.
    pub fn read(&mut self, n: usize) -> BufferResult<Vec<u8>> {
        let out = self.get(n)?;
        self.skip(out.len())?;
        Ok(out)
    }

    /// Fill `out` from the head, consuming what was copied.
    pub fn read_into(&mut self, out: &mut [u8]) -> BufferResult<usize> {
        let chunk = self.read(out.len())?;
        out[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    pub fn has_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Releases the spill file and refuses further use.
    pub fn close(&mut self) {
        self.spill = None;
        self.mem.clear();
        self.mem_pos = 0;
        self.spill_read = 0;
        self.spill_write = 0;
        self.closed = true;
    }
}

impl std::fmt::Debug for OverflowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowBuffer")
            .field("len", &self.len())
            .field("spilled", &self.spill.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let mut buf = OverflowBuffer::new(1024);
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.get(5).unwrap(), b"hello");
        // get does not consume
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read(6).unwrap(), b"hello ");
        assert_eq!(buf.read(64).unwrap(), b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn get_then_skip_matches_consuming_read() {
        let mut a = OverflowBuffer::new(16);
        let mut b = OverflowBuffer::new(16);
        let data = b"0123456789abcdefghij";
        a.append(data).unwrap();
        b.append(data).unwrap();

        let peeked = a.get(7).unwrap();
        a.skip(7).unwrap();
        let taken = b.read(7).unwrap();
        assert_eq!(peeked, taken);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn spills_past_threshold_and_drains_in_order() {
        let mut buf = OverflowBuffer::new(8);
        buf.append(b"abcd").unwrap();
        buf.append(b"efghijkl").unwrap(); // exceeds 8, spills
        assert!(buf.has_spilled());
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.read(12).unwrap(), b"abcdefghijkl");
        assert!(!buf.has_spilled());
    }

    #[test]
    fn interleaved_append_and_consume() {
        let mut buf = OverflowBuffer::new(4);
        buf.append(b"aaaa").unwrap();
        assert_eq!(buf.read(2).unwrap(), b"aa");
        buf.append(b"bbbb").unwrap();
        buf.append(b"cccc").unwrap();
        assert_eq!(buf.read(10).unwrap(), b"aabbbbcccc");
        assert!(buf.is_empty());
    }

    #[test]
    fn skip_past_end_is_an_error() {
        let mut buf = OverflowBuffer::new(64);
        buf.append(b"abc").unwrap();
        assert!(matches!(
            buf.skip(4),
            Err(BufferError::Skip { wanted: 4, len: 3 })
        ));
        // buffer still usable after the failed skip
        assert_eq!(buf.read(3).unwrap(), b"abc");
    }

    #[test]
    fn closed_buffer_refuses_everything() {
        let mut buf = OverflowBuffer::new(64);
        buf.append(b"abc").unwrap();
        buf.close();
        assert!(matches!(buf.get(1), Err(BufferError::Closed)));
        assert!(matches!(buf.append(b"x"), Err(BufferError::Closed)));
        assert!(matches!(buf.skip(0), Err(BufferError::Closed)));
    }
}
