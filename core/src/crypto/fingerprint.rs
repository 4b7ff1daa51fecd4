// Message fingerprint: SHA-256 over the canonical JSON of
// {id, from, to, content, timestamp}, in exactly that order, hex-encoded.
//
// The canonical form follows JSON.stringify's output for the same object,
// so the hash of a given message matches one computed that way. Only the
// fingerprint is shared; sealed payloads use this crate's own cipher.

use crate::message::MessageFields;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical byte string the fingerprint is computed over
pub fn canonical_form(fields: &MessageFields) -> String {
    format!(
        "{{\"id\":{},\"from\":{},\"to\":{},\"content\":{},\"timestamp\":{}}}",
        Value::from(fields.id.as_str()),
        Value::from(fields.from.as_str()),
        Value::from(fields.to.as_str()),
        Value::from(fields.content.as_str()),
        fields.timestamp
    )
}

/// Deterministic 256-bit fingerprint of a message, as lowercase hex
pub fn fingerprint(fields: &MessageFields) -> String {
    hex::encode(Sha256::digest(canonical_form(fields).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields() -> MessageFields {
        MessageFields {
            id: "7d0b2c3a-0000-4000-8000-000000000001".to_string(),
            from: "ALICE".to_string(),
            to: "BOB".to_string(),
            content: "hi".to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_canonical_form_field_order() {
        assert_eq!(
            canonical_form(&fields()),
            r#"{"id":"7d0b2c3a-0000-4000-8000-000000000001","from":"ALICE","to":"BOB","content":"hi","timestamp":1700000000000}"#
        );
    }

    #[test]
    fn test_canonical_form_escapes_strings() {
        let mut f = fields();
        f.content = "say \"hi\"\n".to_string();
        assert!(canonical_form(&f).contains(r#""content":"say \"hi\"\n""#));
    }

    #[test]
    fn test_canonical_form_keeps_non_ascii() {
        let mut f = fields();
        f.content = "héllo ✓ \u{7f}".to_string();
        assert!(canonical_form(&f).contains("\"content\":\"héllo ✓ \u{7f}\""));
    }

    #[test]
    fn test_fingerprint_known_vector() {
        // sha256 of the canonical form above, computed independently
        let expected = hex::encode(Sha256::digest(
            br#"{"id":"7d0b2c3a-0000-4000-8000-000000000001","from":"ALICE","to":"BOB","content":"hi","timestamp":1700000000000}"#,
        ));
        assert_eq!(fingerprint(&fields()), expected);
        assert_eq!(fingerprint(&fields()).len(), 64);
    }

    #[test]
    fn test_every_field_changes_fingerprint() {
        let base = fingerprint(&fields());

        let mut f = fields();
        f.id.push('x');
        assert_ne!(fingerprint(&f), base);

        let mut f = fields();
        f.from.push('x');
        assert_ne!(fingerprint(&f), base);

        let mut f = fields();
        f.to.push('x');
        assert_ne!(fingerprint(&f), base);

        let mut f = fields();
        f.content.push('x');
        assert_ne!(fingerprint(&f), base);

        let mut f = fields();
        f.timestamp += 1;
        assert_ne!(fingerprint(&f), base);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = fields();
        a.from = "AB".to_string();
        a.to = "C".to_string();
        let mut b = fields();
        b.from = "A".to_string();
        b.to = "BC".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    proptest! {
        #[test]
        fn prop_fingerprint_deterministic(
            id in ".{0,40}",
            from in ".{0,40}",
            to in ".{0,40}",
            content in ".{0,200}",
            timestamp in any::<u64>(),
        ) {
            let f = MessageFields { id, from, to, content, timestamp };
            prop_assert_eq!(fingerprint(&f), fingerprint(&f.clone()));
        }
    }
}
