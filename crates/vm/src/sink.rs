//! Output sink plumbing for the `WRITE` syscall.
//!
//! The VM never opens a file descriptor itself (that's the host driver's
//! job): `Vm` holds a boxed `std::io::Write`
//! trait object and every `WRITE` instruction writes through it. The
//! default sink is `std::io::sink()` (a no-op, not a file descriptor) so a
//! freshly loaded `Vm` is runnable without a driver wiring anything up.
//! `SharedBuffer` is the in-memory sink tests use to capture output.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// A `Write` sink backed by a reference-counted in-memory buffer, so a test
/// can keep a handle to read the bytes back after handing the other end to
/// a `Vm` (which takes ownership of the boxed sink).
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        SharedBuffer(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn shared_buffer_captures_writes_through_a_clone() {
        let buf = SharedBuffer::new();
        let mut handle = buf.clone();
        handle.write_all(b"hello").unwrap();
        assert_eq!(buf.as_string(), "hello");
    }
}
