use super::control::*;
use super::priority::*;
use super::use_candidate::*;
use shared::error::*;
use stun::attributes::*;
use stun::message::*;

#[test]
fn test_controlled_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControlled(4321);
    let result = c.get_from(&m);
    assert_eq!(result, Err(Error::ErrAttributeNotFound));

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let decoded = Message::unmarshal(&m.raw)?;
    let mut c1 = AttrControlled::default();
    c1.get_from(&decoded)?;
    assert_eq!(c1, c, "not equal");

    let mut m3 = Message::new();
    m3.add(ATTR_ICE_CONTROLLED, &[0; 100]);
    let mut c2 = AttrControlled::default();
    assert_eq!(c2.get_from(&m3), Err(Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_controlling_get_from() -> Result<()> {
    let mut m = Message::new();
    let c = AttrControlling(u64::MAX - 7);
    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut c1 = AttrControlling::default();
    c1.get_from(&m)?;
    assert_eq!(c1, c);
    assert!(!m.contains(ATTR_ICE_CONTROLLED));

    Ok(())
}

#[test]
fn test_control_get_from() -> Result<()> {
    let mut m = Message::new();
    let c = AttrControl {
        role: Role::Controlled,
        tie_breaker: TieBreaker(1234),
    };
    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut got = AttrControl::default();
    got.get_from(&m)?;
    assert_eq!(got, c);

    let mut m = Message::new();
    let c = AttrControl {
        role: Role::Controlling,
        tie_breaker: TieBreaker(99),
    };
    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;
    let mut got = AttrControl::default();
    got.get_from(&m)?;
    assert_eq!(got.role, Role::Controlling);
    assert_eq!(got.tie_breaker, TieBreaker(99));

    let empty = Message::new();
    let mut got = AttrControl::default();
    assert_eq!(got.get_from(&empty), Err(Error::ErrAttributeNotFound));

    Ok(())
}

#[test]
fn test_priority_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut p = PriorityAttr::default();
    assert_eq!(p.get_from(&m), Err(Error::ErrAttributeNotFound));

    m.build(&[Box::new(BINDING_REQUEST), Box::new(PriorityAttr(0x6e0001ff))])?;
    let decoded = Message::unmarshal(&m.raw)?;
    p.get_from(&decoded)?;
    assert_eq!(p, PriorityAttr(0x6e0001ff));

    let mut m3 = Message::new();
    m3.add(ATTR_PRIORITY, &[0; 100]);
    assert_eq!(p.get_from(&m3), Err(Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_use_candidate_attr_add_to() -> Result<()> {
    let mut m = Message::new();
    assert!(!UseCandidateAttr::is_set(&m), "should not be set");

    m.build(&[Box::new(BINDING_REQUEST), Box::new(UseCandidateAttr::new())])?;

    let decoded = Message::unmarshal(&m.raw)?;
    assert!(UseCandidateAttr::is_set(&decoded), "should be set");

    Ok(())
}
