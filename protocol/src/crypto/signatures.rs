//! # Signing and Verification
//!
//! The narrow sign/verify/hash surface the protocol engine consumes. The
//! engine never touches ed25519-dalek directly; it calls these functions and
//! enforces verify-before-accept on every inbound message.
//!
//! Signable objects are signed over their canonical JSON with the signature
//! field blanked, so the signature never covers itself.

use serde::Serialize;

use super::hash::canonical_json;
use super::keys::{GatewayKeypair, GatewayPublicKey, GatewaySignature};

/// Sign raw bytes.
pub fn sign(keypair: &GatewayKeypair, message: &[u8]) -> GatewaySignature {
    keypair.sign(message)
}

/// Verify raw bytes. `false` covers both a bad signature and a wrong key;
/// callers do not get to tell the difference.
pub fn verify(public_key: &GatewayPublicKey, message: &[u8], signature: &GatewaySignature) -> bool {
    public_key.verify(message, signature)
}

/// Something that carries its own signature field.
///
/// `signing_view` must return a copy with the signature removed; that copy's
/// canonical JSON is what gets signed.
pub trait Signable: Serialize {
    type View: Serialize;

    fn signing_view(&self) -> Self::View;
    fn signature(&self) -> Option<&GatewaySignature>;
    fn set_signature(&mut self, signature: GatewaySignature);
}

/// Sign `object` in place.
pub fn sign_object<T: Signable>(
    keypair: &GatewayKeypair,
    object: &mut T,
) -> Result<(), serde_json::Error> {
    let bytes = canonical_json(&object.signing_view())?;
    object.set_signature(keypair.sign(&bytes));
    Ok(())
}

/// Verify `object`'s embedded signature against `public_key`. An unsigned
/// object never verifies.
pub fn verify_object<T: Signable>(public_key: &GatewayPublicKey, object: &T) -> bool {
    let Some(signature) = object.signature() else {
        return false;
    };
    match canonical_json(&object.signing_view()) {
        Ok(bytes) => public_key.verify(&bytes, signature),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Clone, Serialize)]
    struct Note {
        body: String,
        signature: Option<GatewaySignature>,
    }

    #[derive(Serialize)]
    struct NoteView {
        body: String,
    }

    impl Signable for Note {
        type View = NoteView;

        fn signing_view(&self) -> NoteView {
            NoteView {
                body: self.body.clone(),
            }
        }

        fn signature(&self) -> Option<&GatewaySignature> {
            self.signature.as_ref()
        }

        fn set_signature(&mut self, signature: GatewaySignature) {
            self.signature = Some(signature);
        }
    }

    #[test]
    fn sign_verify_with_correct_and_wrong_key() {
        let kp = GatewayKeypair::generate();
        let other = GatewayKeypair::generate();
        let sig = sign(&kp, b"stage-2 lock assertion");
        assert!(verify(&kp.public_key(), b"stage-2 lock assertion", &sig));
        assert!(!verify(&other.public_key(), b"stage-2 lock assertion", &sig));
    }

    #[test]
    fn signed_object_roundtrip() {
        let kp = GatewayKeypair::generate();
        let mut note = Note {
            body: "hello".into(),
            signature: None,
        };
        assert!(!verify_object(&kp.public_key(), &note));

        sign_object(&kp, &mut note).unwrap();
        assert!(verify_object(&kp.public_key(), &note));

        note.body = "tampered".into();
        assert!(!verify_object(&kp.public_key(), &note));
    }
}
