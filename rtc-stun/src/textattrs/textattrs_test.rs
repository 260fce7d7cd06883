use super::*;

#[test]
fn test_software_get_from() -> Result<()> {
    let mut m = Message::new();
    let v = "Client v0.0.1".to_owned();
    m.add(ATTR_SOFTWARE, v.as_bytes());
    m.write_header();

    let decoded = Message::unmarshal(&m.raw)?;
    let software = TextAttribute::get_from_as(&decoded, ATTR_SOFTWARE)?;
    assert_eq!(software.to_string(), v);

    Ok(())
}

#[test]
fn test_username() -> Result<()> {
    let username = "username".to_owned();
    let u = TextAttribute::new(ATTR_USERNAME, username.clone());
    let mut m = Message::new();
    m.write_header();
    u.add_to(&mut m)?;

    let mut got = TextAttribute {
        attr: ATTR_USERNAME,
        ..Default::default()
    };
    got.get_from(&m)?;
    assert_eq!(got.text, username);

    Ok(())
}

#[test]
fn test_username_too_big() {
    let u = TextAttribute::new(ATTR_USERNAME, "a".repeat(MAX_USERNAME_B + 1));
    let mut m = Message::new();
    assert_eq!(u.add_to(&mut m), Err(Error::ErrAttributeSizeOverflow));
}

#[test]
fn test_text_attribute_unsupported_type() {
    let mut m = Message::new();
    let t = TextAttribute::new(ATTR_ERROR_CODE, "x".to_owned());
    assert!(t.add_to(&mut m).is_err());
    assert!(TextAttribute::get_from_as(&m, ATTR_ERROR_CODE).is_err());
}

#[test]
fn test_text_attribute_missing() {
    let m = Message::new();
    assert_eq!(
        TextAttribute::get_from_as(&m, ATTR_USERNAME).err(),
        Some(Error::ErrAttributeNotFound)
    );
}
