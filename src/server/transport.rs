//! Non-blocking byte transports under a connection.
//!
//! A [`Transport`] never waits: an operation that cannot proceed fails with
//! [`io::ErrorKind::WouldBlock`] and the connection suspends until the
//! driver sees the socket ready again.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;

/// Upper bound on file bytes staged in memory by the fallback file send.
const FILE_STAGING: usize = 64 * 1024;

pub trait Transport: Send {
    /// Reads into `buf`. `Ok(0)` means the peer closed its side.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Writes `before`, then `len` bytes of `file` starting at `offset`, then
    /// `after`. May write less than everything.
    fn send_file(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        before: &[IoSlice<'_>],
        after: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        let staged = len.min(FILE_STAGING);
        let mut buf = vec![0u8; staged];
        file.read_exact_at(&mut buf, offset)?;
        let mut slices: Vec<IoSlice<'_>> = before.to_vec();
        slices.push(IoSlice::new(&buf));
        if staged == len {
            slices.extend_from_slice(after);
        }
        self.write_vectored(&slices)
    }

    /// True for encrypted transports, which cannot use the kernel file send.
    fn is_secure(&self) -> bool {
        false
    }
}

/// A tokio TCP stream used through its `try_*` operations.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    stream: Arc<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    #[cfg(target_os = "linux")]
    fn send_file(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        before: &[IoSlice<'_>],
        after: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        use tokio::io::Interest;

        let mut written = 0;
        let head: usize = before.iter().map(|b| b.len()).sum();
        if head > 0 {
            written = self.stream.try_write_vectored(before)?;
            if written < head {
                return Ok(written);
            }
        }

        if len > 0 {
            let out = self.stream.as_raw_fd();
            let input = file.as_raw_fd();
            let sent = match self
                .stream
                .try_io(Interest::WRITABLE, || sendfile(out, input, offset, len))
            {
                Ok(n) => n,
                Err(_) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            };
            written += sent;
            if sent < len {
                return Ok(written);
            }
        }

        if !after.is_empty() {
            match self.stream.try_write_vectored(after) {
                Ok(n) => written += n,
                Err(_) if written > 0 => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

#[cfg(target_os = "linux")]
fn sendfile(out: i32, input: i32, offset: u64, len: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    // SAFETY: both descriptors stay open for the call and `off` outlives it.
    let n = unsafe { libc::sendfile(out, input, &mut off, len) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[derive(Debug, Default)]
struct Pipe {
    input: VecDeque<u8>,
    eof: bool,
    output: Vec<u8>,
    write_limit: Option<usize>,
    blocked: bool,
}

/// In-memory transport for driving a connection without a socket.
///
/// The paired [`MemoryPeer`] feeds input, closes the stream, throttles or
/// blocks writes and collects output.
#[derive(Debug)]
pub struct MemoryTransport {
    pipe: Arc<Mutex<Pipe>>,
    secure: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryPeer {
    pipe: Arc<Mutex<Pipe>>,
}

pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let pipe = Arc::new(Mutex::new(Pipe::default()));
    (
        MemoryTransport {
            pipe: pipe.clone(),
            secure: false,
        },
        MemoryPeer { pipe },
    )
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    /// Reports the transport as encrypted.
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.pipe);
        if pipe.input.is_empty() {
            return if pipe.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.input.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut pipe = lock(&self.pipe);
        if pipe.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut allowed = pipe.write_limit.map_or(total, |limit| limit.min(total));
        let written = allowed;
        for buf in bufs {
            if allowed == 0 {
                break;
            }
            let n = buf.len().min(allowed);
            pipe.output.extend_from_slice(&buf[..n]);
            allowed -= n;
        }
        Ok(written)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

impl MemoryPeer {
    pub fn push(&self, bytes: &[u8]) {
        lock(&self.pipe).input.extend(bytes);
    }

    /// Ends the input stream.
    pub fn close(&self) {
        lock(&self.pipe).eof = true;
    }

    /// Takes everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.pipe).output)
    }

    /// Caps the bytes accepted by each write.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        lock(&self.pipe).write_limit = limit;
    }

    /// Makes every write fail with `WouldBlock`.
    pub fn set_blocked(&self, blocked: bool) {
        lock(&self.pipe).blocked = blocked;
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.pipe).input.len()
    }
}
