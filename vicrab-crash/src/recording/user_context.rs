// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data the application hands over before a crash: a free-form context
//! object and a ring of breadcrumbs.
//!
//! Both are serialized to JSON when they are set, in normal context, and
//! published through atomic pointers. The capture path takes ownership of
//! the published strings by swapping the pointers to null, so a concurrent
//! update can never free a string while it is being written out. After a
//! non-fatal capture the strings are put back.

use crate::raw_report::Breadcrumb;
use portable_atomic::{AtomicPtr, AtomicUsize};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;

pub const MAX_BREADCRUMBS: usize = 32;

static USER_CONTEXT: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());
static BREADCRUMBS: [AtomicPtr<String>; MAX_BREADCRUMBS] = [EMPTY_SLOT; MAX_BREADCRUMBS];
/// Number of breadcrumbs ever added; the next one goes to `HEAD % MAX`.
static HEAD: AtomicUsize = AtomicUsize::new(0);

fn publish(slot: &AtomicPtr<String>, value: Option<String>) {
    let new = value.map_or(ptr::null_mut(), |value| Box::into_raw(Box::new(value)));
    let old = slot.swap(new, SeqCst);
    if !old.is_null() {
        // SAFETY: every non-null pointer in a slot came from Box::into_raw.
        drop(unsafe { Box::from_raw(old) });
    }
}

/// Replaces the user context written into every future report.
pub fn update_user_context(
    context: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Result<()> {
    let serialized = if context.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&context)?)
    };
    publish(&USER_CONTEXT, serialized);
    Ok(())
}

/// Appends a breadcrumb, evicting the oldest once the ring is full.
pub fn add_breadcrumb(breadcrumb: &Breadcrumb) -> serde_json::Result<()> {
    let line = breadcrumb.to_line()?;
    let index = HEAD.fetch_add(1, SeqCst) % MAX_BREADCRUMBS;
    publish(&BREADCRUMBS[index], Some(line));
    Ok(())
}

pub fn clear_breadcrumbs() {
    for slot in &BREADCRUMBS {
        publish(slot, None);
    }
}

/// What the capture path took out of the published slots.
///
/// SIGNAL SAFETY:
///     Taking and reading only touches atomics and memory that is no
///     longer reachable by anyone else. Dropping frees it, so a fatal
///     capture must [`forget`](std::mem::forget) it or [`restore`] it from
///     normal context.
///
/// [`restore`]: TakenUserData::restore
pub(crate) struct TakenUserData {
    context: *mut String,
    breadcrumbs: [*mut String; MAX_BREADCRUMBS],
    /// Index of the oldest breadcrumb in `breadcrumbs`.
    oldest: usize,
}

impl TakenUserData {
    pub fn take() -> Self {
        let head = HEAD.load(SeqCst);
        let mut breadcrumbs = [ptr::null_mut(); MAX_BREADCRUMBS];
        for (taken, slot) in breadcrumbs.iter_mut().zip(BREADCRUMBS.iter()) {
            *taken = slot.swap(ptr::null_mut(), SeqCst);
        }
        Self {
            context: USER_CONTEXT.swap(ptr::null_mut(), SeqCst),
            breadcrumbs,
            oldest: head % MAX_BREADCRUMBS,
        }
    }

    pub fn context(&self) -> Option<&str> {
        // SAFETY: taken out of the slot, owned by `self`.
        unsafe { self.context.as_ref() }.map(String::as_str)
    }

    /// Breadcrumbs, oldest first.
    pub fn breadcrumbs(&self) -> impl Iterator<Item = &str> + '_ {
        (0..MAX_BREADCRUMBS)
            .map(move |i| self.breadcrumbs[(self.oldest + i) % MAX_BREADCRUMBS])
            // SAFETY: taken out of the slots, owned by `self`.
            .filter_map(|taken| unsafe { taken.as_ref() })
            .map(String::as_str)
    }

    pub fn has_breadcrumbs(&self) -> bool {
        self.breadcrumbs.iter().any(|taken| !taken.is_null())
    }

    /// Puts the data back, unless it was replaced in the meantime.
    pub fn restore(mut self) {
        fn put_back(slot: &AtomicPtr<String>, taken: &mut *mut String) {
            let value = std::mem::replace(taken, ptr::null_mut());
            if value.is_null() {
                return;
            }
            if slot
                .compare_exchange(ptr::null_mut(), value, SeqCst, SeqCst)
                .is_err()
            {
                // SAFETY: still ours, the slot got a newer value.
                drop(unsafe { Box::from_raw(value) });
            }
        }
        put_back(&USER_CONTEXT, &mut self.context);
        for (slot, taken) in BREADCRUMBS.iter().zip(self.breadcrumbs.iter_mut()) {
            put_back(slot, taken);
        }
    }
}

impl Drop for TakenUserData {
    fn drop(&mut self) {
        for taken in std::iter::once(&mut self.context).chain(self.breadcrumbs.iter_mut()) {
            let value = std::mem::replace(taken, ptr::null_mut());
            if !value.is_null() {
                // SAFETY: owned by `self`.
                drop(unsafe { Box::from_raw(value) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::lock_process_state;
    use serde_json::json;

    #[test]
    fn test_take_and_restore() {
        let _guard = lock_process_state();
        clear_breadcrumbs();
        let context = json!({"user": "alice", "build": 42});
        update_user_context(context.as_object().unwrap().clone()).unwrap();
        for i in 0..3 {
            add_breadcrumb(&Breadcrumb::new("test", format!("step {i}"))).unwrap();
        }

        let taken = TakenUserData::take();
        assert_eq!(taken.context(), Some("{\"build\":42,\"user\":\"alice\"}"));
        let messages: Vec<_> = taken
            .breadcrumbs()
            .map(|line| serde_json::from_str::<Breadcrumb>(line).unwrap().message)
            .collect();
        assert_eq!(messages, vec!["step 0", "step 1", "step 2"]);
        // Nothing is published while taken.
        assert!(TakenUserData::take().context().is_none());

        taken.restore();
        let again = TakenUserData::take();
        assert!(again.context().is_some());
        assert_eq!(again.breadcrumbs().count(), 3);
        drop(again);
        update_user_context(serde_json::Map::new()).unwrap();
    }

    #[test]
    fn test_ring_keeps_newest() {
        let _guard = lock_process_state();
        clear_breadcrumbs();
        for i in 0..(MAX_BREADCRUMBS + 5) {
            add_breadcrumb(&Breadcrumb::new("loop", i.to_string())).unwrap();
        }
        let taken = TakenUserData::take();
        let messages: Vec<String> = taken
            .breadcrumbs()
            .map(|line| serde_json::from_str::<Breadcrumb>(line).unwrap().message)
            .collect();
        assert_eq!(messages.len(), MAX_BREADCRUMBS);
        assert_eq!(messages[0], "5");
        assert_eq!(messages[MAX_BREADCRUMBS - 1], (MAX_BREADCRUMBS + 4).to_string());
        taken.restore();
        clear_breadcrumbs();
    }

    #[test]
    fn test_restore_yields_to_newer_value() {
        let _guard = lock_process_state();
        update_user_context(json!({"v": 1}).as_object().unwrap().clone()).unwrap();
        let taken = TakenUserData::take();
        update_user_context(json!({"v": 2}).as_object().unwrap().clone()).unwrap();
        taken.restore();
        let current = TakenUserData::take();
        assert_eq!(current.context(), Some("{\"v\":2}"));
        drop(current);
        update_user_context(serde_json::Map::new()).unwrap();
    }
}
