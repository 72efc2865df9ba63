/// Physical object identifier: volume, page, slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid {
    pub volid: i16,
    pub pageid: i32,
    pub slotid: i16,
}

impl Oid {
    pub const NULL: Oid = Oid {
        volid: -1,
        pageid: -1,
        slotid: -1,
    };

    pub fn new(volid: i16, pageid: i32, slotid: i16) -> Oid {
        Oid {
            volid,
            pageid,
            slotid,
        }
    }

    /// An uninitialized object identifier is treated as semantic NULL by
    /// the `IS NULL` test.
    pub fn is_null(&self) -> bool {
        self.pageid == Oid::NULL.pageid && self.slotid == Oid::NULL.slotid
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}|{}|{})", self.volid, self.pageid, self.slotid)
    }
}
