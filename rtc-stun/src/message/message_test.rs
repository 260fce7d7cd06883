use super::*;
use crate::textattrs::TextAttribute;
use crate::xoraddr::XorMappedAddress;

#[test]
fn test_message_type_value() {
    let tests = vec![
        (BINDING_REQUEST, 0x0001u16),
        (BINDING_SUCCESS, 0x0101),
        (BINDING_ERROR, 0x0111),
        (MessageType::new(Method(0xb6d), MessageClass(0x3)), 0x2ddd),
    ];

    for (input, output) in tests {
        let b = input.value();
        assert_eq!(b, output, "value({input}) -> {b:#06x}, want {output:#06x}");

        let mut decoded = MessageType::default();
        decoded.read_value(b);
        assert_eq!(decoded, input, "read_value({b:#06x}) -> {decoded}, want {input}");
    }
}

#[test]
fn test_message_type_string() {
    assert_eq!(BINDING_REQUEST.to_string(), "Binding request");
    assert_eq!(BINDING_ERROR.to_string(), "Binding error response");
}

#[test]
fn test_is_message() {
    let mut m = Message::new();
    m.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .unwrap();
    assert!(is_message(&m.raw));

    assert!(!is_message(&[]));
    assert!(!is_message(&m.raw[..MESSAGE_HEADER_SIZE - 1]));

    let mut bad_cookie = m.raw.clone();
    bad_cookie[4] ^= 0xff;
    assert!(!is_message(&bad_cookie));

    let mut rtp_like = m.raw.clone();
    rtp_like[0] = 0x80;
    assert!(!is_message(&rtp_like));
}

#[test]
fn test_message_add_pads_attributes() -> Result<()> {
    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, "abc".to_owned())),
    ])?;

    assert_eq!(m.length, 8, "3 byte value should be padded to 4");
    assert_eq!(m.raw.len(), MESSAGE_HEADER_SIZE + 8);
    assert_eq!(&m.raw[2..4], &[0, 8]);
    assert_eq!(m.raw[MESSAGE_HEADER_SIZE + 7], 0, "padding must be zeroed");

    Ok(())
}

#[test]
fn test_message_decode() -> Result<()> {
    let mut m = Message::new();
    let tid = TransactionId([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    m.build(&[
        Box::new(tid),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress::from("203.0.113.9:5000".parse::<std::net::SocketAddr>()?)),
        Box::new(TextAttribute::new(ATTR_SOFTWARE, "rtc-stun".to_owned())),
    ])?;

    let decoded = Message::unmarshal(&m.raw)?;
    assert_eq!(decoded, m);
    assert_eq!(decoded.typ, BINDING_SUCCESS);
    assert_eq!(decoded.transaction_id, tid);
    assert!(decoded.contains(ATTR_XORMAPPED_ADDRESS));
    assert!(decoded.contains(ATTR_SOFTWARE));
    assert!(!decoded.contains(ATTR_USERNAME));
    assert_eq!(decoded.get(ATTR_SOFTWARE)?, b"rtc-stun".to_vec());
    assert_eq!(
        decoded.get(ATTR_USERNAME),
        Err(Error::ErrAttributeNotFound)
    );

    Ok(())
}

#[test]
fn test_message_decode_errors() -> Result<()> {
    assert_eq!(
        Message::unmarshal(&[0, 1, 0, 0]).err(),
        Some(Error::ErrUnexpectedHeaderEof)
    );

    let mut m = Message::new();
    m.build(&[
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, "user:name".to_owned())),
    ])?;

    let mut bad_cookie = m.raw.clone();
    bad_cookie[7] = 0;
    assert_eq!(
        Message::unmarshal(&bad_cookie).err(),
        Some(Error::ErrInvalidMagicCookie)
    );

    let truncated = &m.raw[..m.raw.len() - 4];
    assert_eq!(
        Message::unmarshal(truncated).err(),
        Some(Error::ErrUnexpectedEof)
    );

    let mut bad_attr_len = m.raw.clone();
    bad_attr_len[MESSAGE_HEADER_SIZE + 3] = 0xff;
    assert_eq!(
        Message::unmarshal(&bad_attr_len).err(),
        Some(Error::ErrAttributeSizeInvalid)
    );

    Ok(())
}

#[test]
fn test_message_transaction_id_setter() -> Result<()> {
    let mut request = Message::new();
    request.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;

    let mut response = Message::new();
    response.build(&[Box::new(request.clone()), Box::new(BINDING_SUCCESS)])?;

    assert_eq!(response.transaction_id, request.transaction_id);
    assert_eq!(&response.raw[8..20], &request.transaction_id.0);

    Ok(())
}

#[test]
fn test_transaction_id_uniqueness() {
    let a = TransactionId::new();
    let b = TransactionId::new();
    assert_ne!(a, b);
    assert_eq!(format!("{a:?}").len(), TRANSACTION_ID_SIZE * 2);
}
