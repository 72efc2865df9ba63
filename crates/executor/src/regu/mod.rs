//! Register variables: the algebraic expression tree the planner compiles
//! column references, constants, arithmetic and function calls into.
//!
//! A node owns its children and its value slots; the tree is built once per
//! statement and owned by the XASL node. Evaluation peeks values without
//! copying wherever it can.

pub mod arith;
pub mod fetch;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use squill_lib_core::domain::{DbType, Domain};
use squill_lib_core::value::{DbValue, ListId};

use crate::xasl::XaslNode;

pub use arith::{ArithOp, ArithSpec};
pub use fetch::{Peek, ValueDescriptor, fetch_peek_dbval};

pub type AttrId = i32;

/// Identifier of the table scope (spec) an attribute belongs to.
pub type SpecId = u32;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReguFlags: u16 {
        /// Column does not appear in the output list.
        const HIDDEN_COLUMN          = 0x01;
        const FIELD_COMPARE          = 0x02;
        const FIELD_NESTED           = 0x04;
        /// The subtree is constant-valued; evaluable once and memoizable.
        const ALL_CONST              = 0x08;
        /// The subtree is known non-constant; never fold.
        const NOT_CONST              = 0x10;
        const ANALYTIC_WINDOW        = 0x20;
        const APPLY_COLLATION        = 0x40;
        /// Folded coercions hang off this node and must be released when
        /// the XASL clone is decached.
        const CLEAR_AT_CLONE_DECACHE = 0x80;
    }
}

/// Per-scan cache of attribute values, filled by the storage engine when a
/// heap record or index key is projected. Domain re-validation between
/// consecutive tuples is cached at the comparison term, keyed on the
/// operand types of the previous tuple.
#[derive(Debug, Default)]
pub struct AttrInfoCache {
    values: squill_helpers::HashMap<AttrId, DbValue>,
}

impl AttrInfoCache {
    pub fn new() -> AttrInfoCache {
        AttrInfoCache::default()
    }

    pub fn set_value(&mut self, id: AttrId, value: DbValue) {
        self.values.insert(id, value);
    }

    pub fn value(&self, id: AttrId) -> Option<&DbValue> {
        self.values.get(&id)
    }

    pub fn clear_values(&mut self) {
        self.values.clear();
    }
}

/// Attribute descriptor: which column of which scope, and where its value
/// is cached during the scan.
#[derive(Debug, Clone)]
pub struct AttrDescr {
    pub id: AttrId,
    pub db_type: DbType,
    pub spec_id: SpecId,
    pub cache: Rc<RefCell<AttrInfoCache>>,
}

impl AttrDescr {
    pub fn new(
        id: AttrId,
        db_type: DbType,
        spec_id: SpecId,
        cache: Rc<RefCell<AttrInfoCache>>,
    ) -> AttrDescr {
        AttrDescr {
            id,
            db_type,
            spec_id,
            cache,
        }
    }
}

/// Function opcodes the executor evaluates itself. Method calls dispatch
/// outside the executor and only exist here so push-down can refuse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    SetOf,
    MultisetOf,
    SequenceOf,
    /// Count of regex matches in the source string; memoizes the compiled
    /// pattern in the node's temp slot.
    RegexpCount,
    MethodCall,
}

/// Owned temporary attached to a FUNC node.
#[derive(Debug, Clone)]
pub enum FuncTemp {
    Regex {
        pattern: String,
        case_sensitive: bool,
        regex: fancy_regex::Regex,
    },
}

#[derive(Clone)]
pub struct FuncSpec {
    pub kind: FuncKind,
    pub operands: Vec<ReguVariable>,
    pub value: RefCell<DbValue>,
    /// Memoized owned temporary (e.g. compiled regex); released on
    /// teardown.
    pub temp: RefCell<Option<FuncTemp>>,
}

/// Sequence of register variables backing a VALUES row list; the cursor
/// tracks the row currently being produced.
#[derive(Clone)]
pub struct ReguValueList {
    pub items: Vec<ReguVariable>,
    pub current: Cell<usize>,
}

/// The variant payload of a register variable.
#[derive(Clone)]
pub enum ReguSpec {
    /// Inline owned value.
    Value(RefCell<DbValue>),
    /// Shared value handle (bound outer column, fetched constant).
    Constant(Rc<RefCell<DbValue>>),
    Arith(Box<ArithSpec>),
    Attr(AttrDescr),
    ClassAttr(AttrDescr),
    SharedAttr(AttrDescr),
    /// Position into the current tuple of a list scan.
    Position(usize),
    /// Materialized cursor handle; filled lazily by subquery execution.
    ListId(RefCell<ListId>),
    /// Host-variable slot index.
    PosValue(usize),
    /// Current tuple's object identifier.
    Oid,
    /// Current tuple's class identifier.
    ClassOid,
    Func(Box<FuncSpec>),
    ReguValList(ReguValueList),
    ReguVarList(Vec<ReguVariable>),
}

#[derive(Clone)]
pub struct ReguVariable {
    pub spec: ReguSpec,
    pub domain: Domain,
    /// Domain as compiled; `domain` may narrow during execution and is
    /// restored from this on clone decache.
    pub original_domain: Domain,
    pub flags: Cell<ReguFlags>,
    /// Optional scratch output the fetch copies into for callers that need
    /// an owned value.
    pub vfetch_to: Option<Rc<RefCell<DbValue>>>,
    /// Nested plan reached through this variable (scalar subquery).
    pub xasl: Option<Rc<XaslNode>>,
}

impl ReguVariable {
    pub fn new(spec: ReguSpec, domain: Domain) -> ReguVariable {
        ReguVariable {
            spec,
            domain,
            original_domain: domain,
            flags: Cell::new(ReguFlags::empty()),
            vfetch_to: None,
            xasl: None,
        }
    }

    /// Inline constant with the value's own domain, flagged foldable.
    pub fn constant(value: DbValue) -> ReguVariable {
        let domain = value.domain();
        let regu = ReguVariable::new(ReguSpec::Value(RefCell::new(value)), domain);
        regu.flags.set(ReguFlags::ALL_CONST);
        regu
    }

    pub fn shared_constant(value: Rc<RefCell<DbValue>>) -> ReguVariable {
        let domain = value.borrow().domain();
        ReguVariable::new(ReguSpec::Constant(value), domain)
    }

    pub fn attr(descr: AttrDescr) -> ReguVariable {
        let domain = Domain::new(descr.db_type);
        let regu = ReguVariable::new(ReguSpec::Attr(descr), domain);
        regu.flags.set(ReguFlags::NOT_CONST);
        regu
    }

    pub fn position(pos: usize, domain: Domain) -> ReguVariable {
        let regu = ReguVariable::new(ReguSpec::Position(pos), domain);
        regu.flags.set(ReguFlags::NOT_CONST);
        regu
    }

    pub fn host_var(index: usize, domain: Domain) -> ReguVariable {
        ReguVariable::new(ReguSpec::PosValue(index), domain)
    }

    pub fn list(list_id: ListId) -> ReguVariable {
        ReguVariable::new(ReguSpec::ListId(RefCell::new(list_id)), Domain::NULL)
    }

    pub fn with_xasl(mut self, xasl: Rc<XaslNode>) -> ReguVariable {
        self.xasl = Some(xasl);
        self
    }

    pub fn is_flagged(&self, flag: ReguFlags) -> bool {
        self.flags.get().contains(flag)
    }

    pub fn set_flag(&self, flag: ReguFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    /// Pre-order walk. The closure may raise `stop` to short-circuit the
    /// remainder of the traversal.
    pub fn map(&self, f: &mut dyn FnMut(&ReguVariable, &mut bool)) {
        let mut stop = false;
        self.map_inner(f, &mut stop);
    }

    fn map_inner(&self, f: &mut dyn FnMut(&ReguVariable, &mut bool), stop: &mut bool) {
        f(self, stop);
        if *stop {
            return;
        }
        match &self.spec {
            ReguSpec::Arith(arith) => {
                for child in [&arith.left, &arith.right, &arith.third]
                    .into_iter()
                    .flatten()
                {
                    child.map_inner(f, stop);
                    if *stop {
                        return;
                    }
                }
            }
            ReguSpec::Func(func) => {
                for operand in &func.operands {
                    operand.map_inner(f, stop);
                    if *stop {
                        return;
                    }
                }
            }
            ReguSpec::ReguValList(list) => {
                for item in &list.items {
                    item.map_inner(f, stop);
                    if *stop {
                        return;
                    }
                }
            }
            ReguSpec::ReguVarList(items) => {
                for item in items {
                    item.map_inner(f, stop);
                    if *stop {
                        return;
                    }
                }
            }
            _ => {}
        }
    }

    /// [`ReguVariable::map`] that also visits any nested XASL reached
    /// through a variable's plan link.
    pub fn map_with_xasl(
        &self,
        regu_fn: &mut dyn FnMut(&ReguVariable, &mut bool),
        xasl_fn: &mut dyn FnMut(&XaslNode, &mut bool),
    ) {
        self.map(&mut |regu, stop| {
            regu_fn(regu, stop);
            if *stop {
                return;
            }
            if let Some(xasl) = &regu.xasl {
                xasl_fn(xasl, stop);
            }
        });
    }

    /// Post-order teardown: release memoized temporaries, scratch state and
    /// folded values, and restore compiled domains. Used when an XASL clone
    /// is decached.
    pub fn clear_xasl(&mut self) {
        match &mut self.spec {
            ReguSpec::Value(value) => {
                if self.flags.get().contains(ReguFlags::CLEAR_AT_CLONE_DECACHE) {
                    *value.borrow_mut() = DbValue::Null;
                }
            }
            ReguSpec::Arith(arith) => {
                for child in [&mut arith.left, &mut arith.right, &mut arith.third]
                    .into_iter()
                    .flatten()
                {
                    child.clear_xasl();
                }
                if let Some(pred) = &mut arith.pred {
                    pred.clear_xasl();
                }
                *arith.value.borrow_mut() = DbValue::Null;
                *arith.rand_seed.borrow_mut() = None;
                arith.domain = arith.original_domain;
            }
            ReguSpec::Func(func) => {
                for operand in &mut func.operands {
                    operand.clear_xasl();
                }
                *func.value.borrow_mut() = DbValue::Null;
                *func.temp.borrow_mut() = None;
            }
            ReguSpec::ReguValList(list) => {
                for item in &mut list.items {
                    item.clear_xasl();
                }
                list.current.set(0);
            }
            ReguSpec::ReguVarList(items) => {
                for item in items {
                    item.clear_xasl();
                }
            }
            _ => {}
        }
        self.domain = self.original_domain;
    }
}

impl std::fmt::Display for ReguVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.spec {
            ReguSpec::Value(v) => write!(f, "{}", v.borrow().to_text()),
            ReguSpec::Constant(v) => write!(f, "{}", v.borrow().to_text()),
            ReguSpec::Arith(a) => {
                let left = a.left.as_ref().map(|r| r.to_string()).unwrap_or_default();
                let right = a.right.as_ref().map(|r| r.to_string()).unwrap_or_default();
                write!(f, "{:?}({left}, {right})", a.op)
            }
            ReguSpec::Attr(d) | ReguSpec::ClassAttr(d) | ReguSpec::SharedAttr(d) => {
                write!(f, "@{}.{}", d.spec_id, d.id)
            }
            ReguSpec::Position(p) => write!(f, "pos#{p}"),
            ReguSpec::ListId(l) => write!(f, "list#{}", l.borrow().id),
            ReguSpec::PosValue(i) => write!(f, "?{i}"),
            ReguSpec::Oid => write!(f, "OID"),
            ReguSpec::ClassOid => write!(f, "CLASS_OID"),
            ReguSpec::Func(func) => write!(f, "{:?}(..)", func.kind),
            ReguSpec::ReguValList(_) => write!(f, "VALUES(..)"),
            ReguSpec::ReguVarList(_) => write!(f, "VARLIST(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use squill_lib_core::domain::{DbType, Domain};
    use squill_lib_core::value::DbValue;

    use super::{ArithOp, ArithSpec, ReguSpec, ReguVariable};

    fn add(left: ReguVariable, right: ReguVariable) -> ReguVariable {
        let domain = Domain::new(DbType::Int);
        ReguVariable::new(
            ReguSpec::Arith(Box::new(ArithSpec::binary(ArithOp::Add, domain, left, right))),
            domain,
        )
    }

    #[test]
    fn map_visits_pre_order() {
        let tree = add(
            ReguVariable::constant(DbValue::Int(1)),
            add(
                ReguVariable::constant(DbValue::Int(2)),
                ReguVariable::constant(DbValue::Int(3)),
            ),
        );
        let mut kinds = Vec::new();
        tree.map(&mut |regu, _| {
            kinds.push(match &regu.spec {
                ReguSpec::Arith(_) => "arith",
                ReguSpec::Value(_) => "value",
                _ => "other",
            });
        });
        assert_eq!(kinds, vec!["arith", "value", "arith", "value", "value"]);
    }

    #[test]
    fn map_stop_short_circuits() {
        let tree = add(
            ReguVariable::constant(DbValue::Int(1)),
            ReguVariable::constant(DbValue::Int(2)),
        );
        let mut visited = 0;
        tree.map(&mut |_, stop| {
            visited += 1;
            if visited == 2 {
                *stop = true;
            }
        });
        assert_eq!(visited, 2);
    }
}
