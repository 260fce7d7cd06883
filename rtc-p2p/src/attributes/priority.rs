use stun::attributes::ATTR_PRIORITY;
use stun::checks::*;
use stun::message::*;

use shared::error::*;

/// Represents PRIORITY attribute.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PriorityAttr(pub u32);

const PRIORITY_SIZE: usize = 4; // 32 bit

impl Setter for PriorityAttr {
    // adds PRIORITY attribute to message.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let mut v = vec![0_u8; PRIORITY_SIZE];
        v.copy_from_slice(&self.0.to_be_bytes());
        m.add(ATTR_PRIORITY, &v);
        Ok(())
    }
}

impl Getter for PriorityAttr {
    // decodes PRIORITY attribute from message.
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_PRIORITY)?;

        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;

        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);

        Ok(())
    }
}
