// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Process-wide shared state: sequence counters, the certificate store and
//! the signing/verification path built on it.
//!
//! One [`Context`] is constructed per process and handed by reference to
//! every router, bridge and endpoint it hosts.
//! Real X.509 parsing and TLS handshakes are out of scope; what is in
//! scope is the *storage* of certificate bytes and a lightweight HMAC
//! signing primitive that lets the core message format carry and check
//! verification bits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::identifier::{EndpointId, MessageId, ProcessInstanceId};
use crate::message::{Message, VerificationBits};

type HmacSha256 = Hmac<Sha256>;

/// A stored certificate: opaque PEM (or PEM-like) bytes plus the endpoint
/// id it is claimed for. No chain validation is performed here.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub owner: EndpointId,
    pub pem: Vec<u8>,
}

/// Process-wide sequence counters, certificate store and signing key.
///
/// Sequence numbers are issued per `(endpoint, message_id)` pair and never
/// decrease.
pub struct Context {
    instance_id: ProcessInstanceId,
    sequences: RefCell<HashMap<(EndpointId, MessageId), u64>>,
    own_certificate: RefCell<Option<Certificate>>,
    trusted_certificates: RefCell<HashMap<EndpointId, Certificate>>,
    signing_key: Vec<u8>,
}

impl Context {
    pub fn new() -> Rc<Context> {
        Rc::new(Context {
            instance_id: ProcessInstanceId::generate(),
            sequences: RefCell::new(HashMap::new()),
            own_certificate: RefCell::new(None),
            trusted_certificates: RefCell::new(HashMap::new()),
            signing_key: rand_key(),
        })
    }

    pub fn instance_id(&self) -> ProcessInstanceId {
        self.instance_id
    }

    /// Returns the next sequence number for `(endpoint, id)`, strictly
    /// greater than every value previously returned for that pair.
    pub fn next_sequence(&self, endpoint: EndpointId, id: MessageId) -> u64 {
        let mut sequences = self.sequences.borrow_mut();
        let entry = sequences.entry((endpoint, id)).or_insert(0);
        let seq = *entry;
        *entry += 1;
        seq
    }

    pub fn set_own_certificate(&self, cert: Certificate) {
        *self.own_certificate.borrow_mut() = Some(cert);
    }

    pub fn own_certificate(&self) -> Option<Certificate> {
        self.own_certificate.borrow().clone()
    }

    /// Reads `path` and installs its bytes as `owner`'s own certificate
    /// (`msgbus.{router,bridge,endpoint}.cert_path`). No PEM parsing or
    /// chain validation is performed, matching the rest of this store.
    pub fn load_own_certificate(&self, owner: EndpointId, path: &str) -> io::Result<()> {
        let pem = std::fs::read(path)?;
        self.set_own_certificate(Certificate { owner, pem });
        Ok(())
    }

    pub fn trust_certificate(&self, cert: Certificate) {
        self.trusted_certificates.borrow_mut().insert(cert.owner, cert);
    }

    pub fn certificate_for(&self, owner: EndpointId) -> Option<Certificate> {
        self.trusted_certificates.borrow().get(&owner).cloned()
    }

    /// Signs `message` in place with an HMAC over its addressing and
    /// content fields, setting `SOURCE_PRIVATE_KEY` and `MESSAGE_ID` in its
    /// verification bits.
    pub fn sign(&self, message: &mut Message) {
        let digest = self.mac_for(message);
        message.signature = Some(digest);
        message.verification |= VerificationBits::SOURCE_PRIVATE_KEY | VerificationBits::MESSAGE_ID;
    }

    /// Verifies `message`'s signature against the stored key, clearing the
    /// private-key verification bit (and leaving the rest untouched) on
    /// mismatch — callers above decide whether to accept or reject a
    /// message with a cleared bit.
    pub fn verify(&self, message: &mut Message) -> bool {
        let Some(sig) = message.signature.clone() else {
            message.verification.remove(VerificationBits::SOURCE_PRIVATE_KEY);
            return false;
        };
        let expected = self.mac_for(message);
        if expected == sig {
            true
        } else {
            message.verification.remove(VerificationBits::SOURCE_PRIVATE_KEY);
            false
        }
    }

    fn mac_for(&self, message: &Message) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("hmac accepts any key length");
        mac.update(&message.source_id.0.to_be_bytes());
        mac.update(&message.target_id.0.to_be_bytes());
        mac.update(&message.id.class.value().to_be_bytes());
        mac.update(&message.id.method.value().to_be_bytes());
        mac.update(&message.sequence.to_be_bytes());
        mac.update(&message.content);
        mac.finalize().into_bytes().to_vec()
    }
}

fn rand_key() -> Vec<u8> {
    (0..32).map(|_| rand::random::<u8>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::EndpointId;

    #[test]
    fn sequence_numbers_are_strictly_increasing_per_key() {
        let ctx = Context::new();
        let ep = EndpointId(5);
        let id = MessageId::new("StrUtilReq", "Reverse");
        let other = MessageId::new("StrUtilRes", "Reverse");

        assert_eq!(0, ctx.next_sequence(ep, id));
        assert_eq!(1, ctx.next_sequence(ep, id));
        assert_eq!(0, ctx.next_sequence(ep, other));
        assert_eq!(2, ctx.next_sequence(ep, id));
    }

    #[test]
    fn sign_then_verify_round_trips_and_tamper_detection_fails() {
        let ctx = Context::new();
        let mut msg = Message::new(
            MessageId::new("StrUtilReq", "Reverse"),
            EndpointId(1),
            EndpointId(2),
            b"foo".to_vec(),
        );
        ctx.sign(&mut msg);
        assert!(ctx.verify(&mut msg));

        msg.content = b"tampered".to_vec();
        assert!(!ctx.verify(&mut msg));
        assert!(!msg.verification.contains(VerificationBits::SOURCE_PRIVATE_KEY));
    }

    #[test]
    fn certificate_store_round_trips() {
        let ctx = Context::new();
        let cert = Certificate { owner: EndpointId(3), pem: b"-----FAKE CERT-----".to_vec() };
        ctx.trust_certificate(cert.clone());
        let found = ctx.certificate_for(EndpointId(3)).unwrap();
        assert_eq!(cert.pem, found.pem);
        assert!(ctx.certificate_for(EndpointId(4)).is_none());
    }
}
