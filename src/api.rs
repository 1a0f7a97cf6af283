//! Interfaces the embedding runtime implements so the collector can walk its objects.
//!
//! Objects are plain addresses. The collector never looks inside them; it asks the
//! [`ObjectModel`] for their size and reference slots.

/// Address of an object, null when a slot holds no reference.
pub type ObjectRef = *mut u8;

/// Layout knowledge about the objects stored in the heap.
pub trait ObjectModel: Send + Sync {
    /// Size in bytes of the object at `obj`, including any header.
    fn size_of(&self, obj: ObjectRef) -> usize;

    /// Calls [`Visitor::mark_object`] for every reference slot of `obj` and
    /// [`Visitor::delay_reference_referent`] for weak-like fields.
    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn Visitor);
}

/// Receives reference slots while the collector scans roots and objects.
pub trait Visitor {
    /// `slot` may be rewritten with the new address of the referent.
    fn mark_object(&mut self, slot: &mut ObjectRef);

    /// `reference` is an object whose referent must not be followed eagerly. It is handed to
    /// the [`ReferenceProcessor`] once marking is done.
    fn delay_reference_referent(&mut self, reference: ObjectRef) {
        let _ = reference;
    }
}

/// Source of root slots, visited once per marking phase.
pub trait RootSet {
    fn visit_roots(&mut self, visitor: &mut dyn Visitor);
}

impl RootSet for [ObjectRef] {
    fn visit_roots(&mut self, visitor: &mut dyn Visitor) {
        for root in self.iter_mut() {
            visitor.mark_object(root);
        }
    }
}

impl RootSet for Vec<ObjectRef> {
    fn visit_roots(&mut self, visitor: &mut dyn Visitor) {
        self.as_mut_slice().visit_roots(visitor)
    }
}

impl<F: FnMut(&mut dyn Visitor)> RootSet for F {
    fn visit_roots(&mut self, visitor: &mut dyn Visitor) {
        self(visitor)
    }
}

/// Queries the collector offers to reference processing while a cycle is running.
pub trait MarkCallbacks {
    /// New address of `obj` if it survives the cycle, `None` if it is dead.
    fn get_marked_forward_address(&self, obj: ObjectRef) -> Option<ObjectRef>;

    /// Keeps `obj` alive and returns its new address. Its referents are only visited after
    /// [`MarkCallbacks::process_mark_stack`].
    fn mark_object(&mut self, obj: ObjectRef) -> ObjectRef;

    fn process_mark_stack(&mut self);
}

/// Handles weak-like references found while marking.
pub trait ReferenceProcessor {
    /// Called after the reachable graph has been copied, with every reference object passed
    /// to [`Visitor::delay_reference_referent`] during this cycle. Referents that should stay
    /// alive must go through `callbacks.mark_object` followed by
    /// `callbacks.process_mark_stack`; the others should be cleared.
    fn process_references(
        &mut self,
        references: &[ObjectRef],
        clear_soft_references: bool,
        callbacks: &mut dyn MarkCallbacks,
    );

    /// Updates or clears runtime-internal weak tables.
    fn sweep_system_weaks(&mut self, callbacks: &dyn MarkCallbacks) {
        let _ = callbacks;
    }
}

/// Reference processor that ignores every delayed reference.
#[derive(Default)]
pub struct NoReferenceProcessing;

impl ReferenceProcessor for NoReferenceProcessing {
    fn process_references(
        &mut self,
        _references: &[ObjectRef],
        _clear_soft_references: bool,
        _callbacks: &mut dyn MarkCallbacks,
    ) {
    }
}
