#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use tickrt::config::MAX_IMAGE_BYTES;
use tickrt::hal::{OutputBank, SystemControl};
use tickrt::image::{append_signature, write_unsigned};
use tickrt::telemetry::{LogRecord, LogSink, SinkError};
use tickrt::{HardwareFault, ModuleStore};

pub const SK_BYTES: [u8; 32] = [0x5A; 32];

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&SK_BYTES.into()).expect("valid signing key")
}

/// Compressed public key, leaked so it can be handed to a loader.
pub fn public_key() -> &'static [u8] {
    let point = signing_key().verifying_key().to_encoded_point(true);
    Box::leak(point.as_bytes().to_vec().into_boxed_slice())
}

pub fn signed_image(entry: u8, version: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = [0u8; MAX_IMAGE_BYTES];
    let signed = write_unsigned(entry, version, payload, &mut buf).expect("image fits");
    let sig: Signature = signing_key().sign(&buf[..signed]);
    let len = append_signature(&mut buf, signed, &sig.to_bytes()).expect("signature fits");
    buf[..len].to_vec()
}

/// Same image with one payload bit flipped after signing.
pub fn tampered_image(entry: u8, version: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = signed_image(entry, version, payload);
    bytes[16] ^= 0x80;
    bytes
}

#[derive(Default)]
pub struct MemStore {
    pub image: Option<Vec<u8>>,
    pub writes: u32,
}

impl ModuleStore for MemStore {
    fn load_last_known_good(&mut self, buf: &mut [u8]) -> Result<Option<usize>, HardwareFault> {
        match &self.image {
            Some(image) => {
                buf[..image.len()].copy_from_slice(image);
                Ok(Some(image.len()))
            }
            None => Ok(None),
        }
    }

    fn store_last_known_good(&mut self, image: &[u8]) -> Result<(), HardwareFault> {
        self.image = Some(image.to_vec());
        self.writes += 1;
        Ok(())
    }
}

/// Shared record of side effects, in the order they happened.
pub type Journal = Rc<RefCell<Vec<&'static str>>>;

pub struct FlakyOutputs {
    pub journal: Journal,
    pub working: bool,
}

impl OutputBank for FlakyOutputs {
    fn disable_all(&mut self) -> Result<(), HardwareFault> {
        self.journal.borrow_mut().push("disable");
        if self.working {
            Ok(())
        } else {
            Err(HardwareFault::new("pwm", 7))
        }
    }
}

pub struct JournalSink {
    pub journal: Journal,
    pub working: bool,
    pub records: Vec<LogRecord>,
}

impl LogSink for JournalSink {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        self.journal.borrow_mut().push("append");
        if self.working {
            self.records.push(*record);
            Ok(())
        } else {
            Err(SinkError::Io(5))
        }
    }
}

pub struct JournalControl {
    pub journal: Journal,
}

impl SystemControl for JournalControl {
    fn halt(&mut self) {
        self.journal.borrow_mut().push("halt");
    }

    fn reboot(&mut self) {
        self.journal.borrow_mut().push("reboot");
    }
}
