use super::*;

#[test]
fn test_error_code_attribute() -> Result<()> {
    let mut m = Message::new();
    let attr = ErrorCodeAttribute {
        code: CODE_ROLE_CONFLICT,
        reason: b"Role Conflict".to_vec(),
    };
    assert_eq!(attr.to_string(), "487: Role Conflict");
    m.build(&[Box::new(BINDING_ERROR), Box::new(attr.clone())])?;

    let decoded = Message::unmarshal(&m.raw)?;
    let mut got = ErrorCodeAttribute::default();
    got.get_from(&decoded)?;
    assert_eq!(got, attr);
    assert_eq!(got.reason_text(), "Role Conflict");

    Ok(())
}

#[test]
fn test_error_code_default_reason() -> Result<()> {
    let mut m = Message::new();
    CODE_UNAUTHORIZED.add_to(&mut m)?;

    let mut got = ErrorCodeAttribute::default();
    got.get_from(&m)?;
    assert_eq!(got.code, CODE_UNAUTHORIZED);
    assert_eq!(got.reason_text(), "Unauthorized");

    assert_eq!(
        ErrorCode(999).add_to(&mut m),
        Err(Error::ErrNoDefaultReason)
    );
    assert_eq!(
        CODE_SERVER_NOT_REACHABLE.add_to(&mut m),
        Err(Error::ErrNoDefaultReason),
        "the local unreachable code is never put on the wire"
    );

    Ok(())
}

#[test]
fn test_error_code_attribute_get_from_short() {
    let mut m = Message::new();
    m.add(ATTR_ERROR_CODE, &[1]);

    let mut got = ErrorCodeAttribute::default();
    assert_eq!(got.get_from(&m), Err(Error::ErrUnexpectedEof));
}

#[test]
fn test_error_code_attribute_reason_too_long() {
    let mut m = Message::new();
    let attr = ErrorCodeAttribute {
        code: CODE_SERVER_ERROR,
        reason: vec![b'a'; 2048],
    };
    assert_eq!(attr.add_to(&mut m), Err(Error::ErrAttributeSizeOverflow));
}
