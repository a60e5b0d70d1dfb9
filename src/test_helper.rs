//! Scripted serial device for driving the transport in tests.
//!
//! Tests inject the module side of the dialogue up front (or between
//! operations) and read back everything the crate wrote. An empty
//! receive buffer parks the reader, so timeout paths run for real.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

#[derive(Default)]
struct Inner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

/// Cloneable handle; all clones share one wire.
#[derive(Clone, Default)]
pub struct MockSerial(Rc<RefCell<Inner>>);

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes the module "sends".
    pub fn inject(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend(bytes);
    }

    /// Everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().tx.clone()
    }

    /// Like `written`, but clears the record.
    pub fn take_written(&self) -> Vec<u8> {
        core::mem::take(&mut self.0.borrow_mut().tx)
    }
}

impl embedded_io_async::ErrorType for MockSerial {
    type Error = core::convert::Infallible;
}

impl embedded_io_async::Read for MockSerial {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        loop {
            {
                let mut inner = self.0.borrow_mut();
                if !inner.rx.is_empty() {
                    let n = buf.len().min(inner.rx.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inner.rx.pop_front().unwrap();
                    }
                    return Ok(n);
                }
            }
            embassy_futures::yield_now().await;
        }
    }
}

impl embedded_io_async::Write for MockSerial {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().tx.extend_from_slice(buf);
        Ok(buf.len())
    }
}
