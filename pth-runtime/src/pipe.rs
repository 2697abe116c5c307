//! Non-blocking pipes carrying pointer-sized words.
//!
//! Every message is exactly one native-endian `usize`. Writes of that size
//! are below `PIPE_BUF` and therefore atomic, so concurrent writers from
//! different scheduler instances never interleave and readers never see a
//! torn word. The word `0` is a doorbell: it wakes a blocked reader and
//! carries nothing.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use crate::tcb::Tcb;

const WORD: usize = mem::size_of::<usize>();

/// A pipe with both ends set to `O_NONBLOCK | O_CLOEXEC`.
#[derive(Debug)]
pub(crate) struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, so both descriptors are open and owned by
        // nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Pipe { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Write one word. A full pipe reports `WouldBlock`.
    pub(crate) fn send_word(&self, word: usize) -> io::Result<()> {
        let bytes = word.to_ne_bytes();
        loop {
            // SAFETY: `bytes` is valid for `WORD` bytes.
            let n = unsafe { libc::write(self.write_fd(), bytes.as_ptr().cast(), WORD) };
            if n == WORD as isize {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if n < 0 && err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if n >= 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short pipe write"));
            }
            return Err(err);
        }
    }

    /// Read one word, or `None` when the pipe is currently empty.
    pub(crate) fn recv_word(&self) -> io::Result<Option<usize>> {
        let mut bytes = [0u8; WORD];
        loop {
            // SAFETY: `bytes` is valid for `WORD` writable bytes.
            let n = unsafe { libc::read(self.read_fd(), bytes.as_mut_ptr().cast(), WORD) };
            if n == WORD as isize {
                return Ok(Some(usize::from_ne_bytes(bytes)));
            }
            if n == 0 {
                return Ok(None);
            }
            if n > 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "torn pipe word"));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Wake whoever polls the read end. A full pipe is already readable.
    pub(crate) fn ring_doorbell(&self) {
        match self.send_word(0) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "doorbell write failed"),
        }
    }

    /// Read and return every byte currently buffered.
    pub(crate) fn drain_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` is valid for its full length.
            let n = unsafe { libc::read(self.read_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            match usize::try_from(n) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        out
    }
}

// ── In-flight threads ───────────────────────────────────────────────────

/// A thread control block that belongs to no scheduler instance while it
/// travels through a receive pipe.
///
/// Created from an owned `Box<Tcb>`, consumed by [`InFlight::send`] and
/// produced again only by [`InFlight::receive`]. Dropping one frees the
/// control block.
#[derive(Debug)]
pub(crate) struct InFlight(NonNull<Tcb>);

// SAFETY: An `InFlight` is the unique owner of its control block; nothing
// else can reach the block until `land` hands it back out.
unsafe impl Send for InFlight {}

impl InFlight {
    pub(crate) fn launch(tcb: Box<Tcb>) -> Self {
        InFlight(NonNull::from(Box::leak(tcb)))
    }

    /// Hand ownership to whoever reads `pipe`. On failure the thread comes
    /// back unchanged so the caller can keep it.
    pub(crate) fn send(self, pipe: &Pipe) -> Result<(), (InFlight, io::Error)> {
        match pipe.send_word(self.0.as_ptr() as usize) {
            Ok(()) => {
                mem::forget(self);
                Ok(())
            }
            Err(e) => Err((self, e)),
        }
    }

    /// Take the next thread out of `pipe`, skipping doorbells.
    pub(crate) fn receive(pipe: &Pipe) -> io::Result<Option<InFlight>> {
        loop {
            match pipe.recv_word()? {
                None => return Ok(None),
                Some(0) => continue,
                Some(word) => {
                    let ptr = NonNull::new(word as *mut Tcb)
                        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "null thread"))?;
                    return Ok(Some(InFlight(ptr)));
                }
            }
        }
    }

    /// Take ownership on the receiving side.
    pub(crate) fn land(self) -> Box<Tcb> {
        let ptr = self.0;
        mem::forget(self);
        // SAFETY: `ptr` came from `Box::leak` in `launch` and ownership has
        // travelled with this value ever since.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // SAFETY: as in `land`; this value is the sole owner.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}
