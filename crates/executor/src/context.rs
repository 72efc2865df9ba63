//! Per-worker execution context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use squill_lib_core::errors::{ErrorSlot, SquillError};
use squill_lib_core::logical::Logical;
use squill_lib_core::params::SystemParameters;

use crate::external::{HeapStorage, ListCursorEngine, NoStorage, SubqueryRuntime};

static NO_STORAGE: NoStorage = NoStorage;

/// State one worker carries through an evaluation: the collaborator
/// surfaces, the error slot, the recursion guard and the interrupt flag.
pub struct ExecContext<'a> {
    pub params: &'a SystemParameters,
    pub error: ErrorSlot,
    pub heap: &'a dyn HeapStorage,
    pub cursors: &'a dyn ListCursorEngine,
    pub subquery: &'a dyn SubqueryRuntime,
    recursion_depth: usize,
    interrupt: Arc<AtomicBool>,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        params: &'a SystemParameters,
        heap: &'a dyn HeapStorage,
        cursors: &'a dyn ListCursorEngine,
        subquery: &'a dyn SubqueryRuntime,
    ) -> ExecContext<'a> {
        ExecContext {
            params,
            error: ErrorSlot::default(),
            heap,
            cursors,
            subquery,
            recursion_depth: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context with no storage attached; evaluates pure expressions.
    pub fn detached(params: &'a SystemParameters) -> ExecContext<'a> {
        ExecContext::new(params, &NO_STORAGE, &NO_STORAGE, &NO_STORAGE)
    }

    pub fn with_cursors(
        params: &'a SystemParameters,
        cursors: &'a dyn ListCursorEngine,
    ) -> ExecContext<'a> {
        ExecContext::new(params, &NO_STORAGE, cursors, &NO_STORAGE)
    }

    /// Record `err` and collapse to the out-of-band error state.
    pub fn error(&mut self, err: SquillError) -> Logical {
        self.error.set(err);
        Logical::Error
    }

    /// Share the interrupt flag with a canceling thread.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn recursion_depth(&self) -> usize {
        self.recursion_depth
    }

    pub fn inc_recursion_depth(&mut self) {
        self.recursion_depth += 1;
    }

    pub fn dec_recursion_depth(&mut self) {
        debug_assert!(self.recursion_depth > 0);
        self.recursion_depth -= 1;
    }
}
