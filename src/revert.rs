//! Online revert detection over a page's revision stream

use std::collections::HashMap;

use crate::types::SHA1_LEN;

/// Per-page memory mapping content hashes to the serial number of the most
/// recent revision that carried them.
///
/// Only full-length hashes enter the memory; shorter values mean a corrupt or
/// missing sha1 in the dump and must not pollute it. The serial counter
/// advances for every revision regardless.
#[derive(Debug, Default)]
pub struct RevertDetector {
    serial: u32,
    hash_to_serial: HashMap<String, u32>,
}

impl RevertDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next revision's content hash and return its revert distance:
    /// 0 for content not seen before on this page, otherwise the number of
    /// revisions strictly between this one and the most recent revision with
    /// the same hash.
    pub fn observe(&mut self, sha1: &str) -> u32 {
        let mut distance = 0;
        if let Some(&previous) = self.hash_to_serial.get(sha1) {
            distance = self.serial - previous - 1;
        }
        if sha1.len() == SHA1_LEN {
            self.hash_to_serial.insert(sha1.to_owned(), self.serial);
        }
        self.serial += 1;
        distance
    }

    /// Serial number the next revision will receive; equals the number of
    /// revisions observed so far.
    pub fn serial(&self) -> u32 {
        self.serial
    }
}
