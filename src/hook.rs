//! Observer lists for control-plane extension points.
//!
//! A [`Hook`] is an ordered list of callbacks fired against a mutable event
//! argument. The list is iteration-safe: a callback may disconnect any slot
//! (including its own) while the hook is firing, and the slot is only
//! reclaimed once all nested fires have unwound.
//!
//! Hooks are single-threaded control-plane structures and are deliberately
//! not `Send`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// What a hook callback tells the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookResult {
    /// Continue with the next slot.
    Ok,
    /// Stop iterating; remaining slots are skipped.
    Stop,
    /// Abort the operation that fired the hook; remaining slots are
    /// skipped.
    Cancel,
}

struct SlotState<A> {
    dead: Cell<bool>,
    #[allow(clippy::type_complexity)]
    cb: RefCell<Option<Box<dyn FnMut(&mut A) -> HookResult>>>,
}

/// Handle returned by [`Hook::connect`], used to disconnect the slot.
pub struct HookSlot<A>(Rc<SlotState<A>>);

/// An ordered, iteration-safe observer list.
///
/// Callbacks run in connection order. Disconnection during a fire marks the
/// slot dead (it will not run again) and defers removal until the fire
/// completes.
pub struct Hook<A> {
    slots: RefCell<Vec<Rc<SlotState<A>>>>,
    firing: Cell<u32>,
    n_dead: Cell<u32>,
}

impl<A> Hook<A> {
    /// Create an empty hook.
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            firing: Cell::new(0),
            n_dead: Cell::new(0),
        }
    }

    /// Append a callback; it runs after all previously connected slots.
    pub fn connect(&self, cb: impl FnMut(&mut A) -> HookResult + 'static) -> HookSlot<A> {
        let state = Rc::new(SlotState {
            dead: Cell::new(false),
            cb: RefCell::new(Some(Box::new(cb))),
        });
        self.slots.borrow_mut().push(Rc::clone(&state));
        HookSlot(state)
    }

    /// Disconnect a slot.
    ///
    /// Safe to call from inside a firing callback (even the slot's own):
    /// the slot is marked dead immediately and removed once the fire
    /// unwinds.
    pub fn slot_free(&self, slot: &HookSlot<A>) {
        if slot.0.dead.replace(true) {
            return;
        }
        if self.firing.get() > 0 {
            self.n_dead.set(self.n_dead.get() + 1);
        } else {
            slot.0.cb.borrow_mut().take();
            self.slots
                .borrow_mut()
                .retain(|s| !Rc::ptr_eq(s, &slot.0));
        }
    }

    /// Fire the hook against `arg`.
    ///
    /// Runs live slots in connection order; a [`HookResult::Stop`] or
    /// [`HookResult::Cancel`] short-circuits the pass and becomes the
    /// return value.
    pub fn fire(&self, arg: &mut A) -> HookResult {
        // Snapshot so callbacks may connect or disconnect freely.
        let snapshot: Vec<Rc<SlotState<A>>> = self.slots.borrow().clone();
        self.firing.set(self.firing.get() + 1);

        let mut result = HookResult::Ok;
        for slot in &snapshot {
            if slot.dead.get() {
                continue;
            }
            // A slot already borrowed by an outer fire is skipped rather
            // than re-entered.
            let Ok(mut cb) = slot.cb.try_borrow_mut() else {
                continue;
            };
            if let Some(cb) = cb.as_mut() {
                result = cb(arg);
                if result != HookResult::Ok {
                    break;
                }
            }
        }

        self.firing.set(self.firing.get() - 1);
        if self.firing.get() == 0 && self.n_dead.get() > 0 {
            let mut slots = self.slots.borrow_mut();
            for slot in slots.iter().filter(|s| s.dead.get()) {
                slot.cb.borrow_mut().take();
            }
            slots.retain(|s| !s.dead.get());
            self.n_dead.set(0);
        }
        result
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.borrow().iter().filter(|s| !s.dead.get()).count()
    }

    /// Whether no live slots are connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A> Default for Hook<A> {
    fn default() -> Self {
        Self::new()
    }
}
