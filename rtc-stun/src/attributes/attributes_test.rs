use super::*;

#[test]
fn test_raw_attribute_add_to() -> Result<()> {
    let v = vec![1, 2, 3, 4];
    let mut m = Message::new();
    m.build(&[Box::new(RawAttribute {
        typ: ATTR_DATA_PROBE,
        value: v.clone(),
        ..Default::default()
    })])?;

    let got = m.get(ATTR_DATA_PROBE)?;
    assert_eq!(got, v);

    Ok(())
}

const ATTR_DATA_PROBE: AttrType = AttrType(0x0013);

#[test]
fn test_attributes_get() {
    let a = Attributes(vec![
        RawAttribute {
            typ: ATTR_ERROR_CODE,
            ..Default::default()
        },
        RawAttribute {
            typ: ATTR_USERNAME,
            value: b"first".to_vec(),
            ..Default::default()
        },
        RawAttribute {
            typ: ATTR_USERNAME,
            value: b"second".to_vec(),
            ..Default::default()
        },
    ]);

    let (attr, ok) = a.get(ATTR_USERNAME);
    assert!(ok);
    assert_eq!(attr.value, b"first".to_vec(), "first match wins");

    let (_, ok) = a.get(ATTR_FINGERPRINT);
    assert!(!ok);
}

#[test]
fn test_attr_type_range() {
    for a in [ATTR_PRIORITY, ATTR_ERROR_CODE, ATTR_USE_CANDIDATE, ATTR_USERNAME] {
        assert!(a.required(), "{a} should be required");
        assert!(!a.optional());
    }
    for a in [ATTR_SOFTWARE, ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_FINGERPRINT] {
        assert!(a.optional(), "{a} should be optional");
        assert!(!a.required());
    }
}

#[test]
fn test_attr_type_string() {
    assert_eq!(ATTR_XORMAPPED_ADDRESS.to_string(), "XOR-MAPPED-ADDRESS");
    assert_eq!(AttrType(0xabcd).to_string(), "0xabcd");
}

#[test]
fn test_padding() {
    let tt = vec![(4, 4), (2, 4), (5, 8), (8, 8), (11, 12), (1, 4), (3, 4), (6, 8), (7, 8), (0, 0), (40, 40)];
    for (input, expected) in tt {
        assert_eq!(
            nearest_padded_value_length(input),
            expected,
            "padded({input}) should be {expected}"
        );
    }
}

#[test]
fn test_compat_attr_type() {
    assert_eq!(compat_attr_type(0x8020), ATTR_XORMAPPED_ADDRESS);
    assert_eq!(compat_attr_type(0x0020), ATTR_XORMAPPED_ADDRESS);
    assert_eq!(compat_attr_type(0x0006), ATTR_USERNAME);
}
