use super::*;
use crate::fingerprint::FINGERPRINT;
use crate::textattrs::TextAttribute;

fn build_signed(password: &str, with_fingerprint: bool) -> Result<Message> {
    let mut m = Message::new();
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, "remote:local".to_owned())),
        Box::new(MessageIntegrity::new_short_term_integrity(
            password.to_owned(),
        )),
    ];
    if with_fingerprint {
        setters.push(Box::new(FINGERPRINT));
    }
    m.build(&setters)?;
    Ok(m)
}

#[test]
fn test_message_integrity_add_to_and_check() -> Result<()> {
    let m = build_signed("secret-password", false)?;
    assert!(m.contains(ATTR_MESSAGE_INTEGRITY));

    let mut decoded = Message::unmarshal(&m.raw)?;
    MessageIntegrity::new_short_term_integrity("secret-password".to_owned())
        .check(&mut decoded)?;

    let result = MessageIntegrity::new_short_term_integrity("wrong".to_owned())
        .check(&mut decoded);
    assert_eq!(result, Err(Error::ErrIntegrityMismatch));

    Ok(())
}

#[test]
fn test_message_integrity_check_with_fingerprint() -> Result<()> {
    let m = build_signed("secret-password", true)?;
    let mut decoded = Message::unmarshal(&m.raw)?;
    let before = decoded.raw.clone();

    MessageIntegrity::new_short_term_integrity("secret-password".to_owned())
        .check(&mut decoded)?;
    assert_eq!(decoded.raw, before, "check must restore the length field");
    FINGERPRINT.check(&decoded)?;

    Ok(())
}

#[test]
fn test_message_integrity_tampered() -> Result<()> {
    let m = build_signed("secret-password", false)?;
    let mut raw = m.raw.clone();
    // flip a byte of the USERNAME value
    raw[MESSAGE_HEADER_SIZE + ATTRIBUTE_HEADER_SIZE] ^= 0x01;

    let mut decoded = Message::unmarshal(&raw)?;
    let result = MessageIntegrity::new_short_term_integrity("secret-password".to_owned())
        .check(&mut decoded);
    assert_eq!(result, Err(Error::ErrIntegrityMismatch));

    Ok(())
}

#[test]
fn test_message_integrity_before_fingerprint() -> Result<()> {
    let mut m = Message::new();
    m.write_header();
    FINGERPRINT.add_to(&mut m)?;

    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());
    assert_eq!(i.add_to(&mut m), Err(Error::ErrFingerprintBeforeIntegrity));

    Ok(())
}

#[test]
fn test_message_integrity_missing() {
    let mut m = Message::new();
    m.write_header();
    let i = MessageIntegrity::new_short_term_integrity("password".to_owned());
    assert_eq!(i.check(&mut m), Err(Error::ErrAttributeNotFound));
}
