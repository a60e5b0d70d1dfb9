//! Unsolicited result code matching.
//!
//! Feature groups register rules describing the lines they own; the
//! transport tests every incoming line against the table before the line
//! can count towards a pending response.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::config::URC_RULE_MAX;
use crate::error::Error;

/// Reaction to one unsolicited line.
///
/// Handlers run inline on the stack of whichever task is driving the read
/// loop and must not block. Anything long-running copies the line, hands
/// it to a queue and returns.
pub trait UrcHandler: Sync {
    /// Wire bytes that follow the matched line and belong to it (payload
    /// announced by the line itself). The transport drains exactly this
    /// many bytes before dispatch, so stream framing survives even when
    /// the handler then discards the event.
    fn trailing_len(&self, token: u8, line: &[u8]) -> usize {
        let _ = (token, line);
        0
    }

    fn handle(&self, token: u8, line: &[u8], trailing: &[u8]);
}

/// One row of the match table. The token is handed back to the handler so
/// a single handler object can serve several rules.
#[derive(Clone, Copy)]
pub struct UrcRule<'a> {
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub token: u8,
    pub handler: &'a dyn UrcHandler,
}

pub(crate) struct UrcTable<'a> {
    rules: Mutex<CriticalSectionRawMutex, RefCell<Vec<UrcRule<'a>, URC_RULE_MAX>>>,
}

impl<'a> UrcTable<'a> {
    pub const fn new() -> Self {
        Self {
            rules: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub fn replace(&self, rules: &[UrcRule<'a>]) -> Result<(), Error> {
        self.rules.lock(|r| {
            let mut r = r.borrow_mut();
            r.clear();
            r.extend_from_slice(rules).map_err(|_| Error::Exhausted)
        })
    }

    pub fn add(&self, rules: &[UrcRule<'a>]) -> Result<(), Error> {
        self.rules.lock(|r| {
            let mut r = r.borrow_mut();
            for rule in rules {
                r.push(*rule).map_err(|_| Error::Exhausted)?;
            }
            Ok(())
        })
    }

    /// First full match in table order. The prefix anchors at the line
    /// start, the suffix at its end; an empty pattern matches anything.
    pub fn matches(&self, line: &[u8]) -> Option<UrcRule<'a>> {
        self.rules.lock(|r| {
            r.borrow().iter().copied().find(|rule| {
                let (p, s) = (rule.prefix.as_bytes(), rule.suffix.as_bytes());
                line.len() >= p.len() + s.len() && line.starts_with(p) && line.ends_with(s)
            })
        })
    }
}
