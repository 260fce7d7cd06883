use super::*;
use crate::attributes::ATTR_SOFTWARE;
use crate::textattrs::TextAttribute;

#[test]
fn test_fingerprint_value() {
    assert_eq!(fingerprint_value(b"123456789"), 0x98a06c68);
}

#[test]
fn test_fingerprint_check() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "software".to_owned())),
        Box::new(FINGERPRINT),
    ])?;

    let decoded = Message::unmarshal(&m.raw)?;
    FINGERPRINT.check(&decoded)?;
    decoded.check(&[FINGERPRINT])?;

    let mut tampered = m.raw.clone();
    tampered[MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE] ^= 0x20;
    let decoded = Message::unmarshal(&tampered)?;
    assert_eq!(
        FINGERPRINT.check(&decoded),
        Err(Error::ErrFingerprintMismatch)
    );

    Ok(())
}

#[test]
fn test_fingerprint_check_bad_size() {
    let mut m = Message::new();
    m.write_header();
    m.add(ATTR_FINGERPRINT, &[1, 2, 3]);
    assert_eq!(FINGERPRINT.check(&m), Err(Error::ErrAttributeSizeInvalid));
}

#[test]
fn test_fingerprint_missing() {
    let m = Message::new();
    assert_eq!(FINGERPRINT.check(&m), Err(Error::ErrAttributeNotFound));
}
