//! Ambient metadata attached to events.
//!
//! Frames live on a per-thread stack. [`enter`] pushes a frame and returns a
//! guard that truncates the stack back to its previous depth when dropped,
//! including during unwinding. Nested frames merge their metadata over the
//! enclosing frame and keep its id.

use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub Ulid);

impl ContextId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Same 128 bits as a UUID, the form stored in `pgh_context_id`.
    #[must_use]
    pub fn as_uuid(self) -> Uuid {
        Uuid::from_u128(self.0 .0)
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_uuid().hyphenated())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextFrame {
    pub id: ContextId,
    pub metadata: Map<String, Value>,
}

impl ContextFrame {
    #[must_use]
    pub fn metadata_json(&self) -> String {
        Value::Object(self.metadata.clone()).to_string()
    }

    /// Transaction-local settings read by Postgres triggers, as a statement
    /// and its two text parameters.
    #[must_use]
    pub fn postgres_prelude(&self) -> (&'static str, [String; 2]) {
        (
            "SELECT set_config('pghistory.context_id', $1, true), \
             set_config('pghistory.context_metadata', $2, true)",
            [self.id.to_string(), self.metadata_json()],
        )
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<ContextFrame>> = const { RefCell::new(Vec::new()) };
}

/// Keeps a context frame active. Not `Send`: the frame belongs to the
/// thread that entered it.
#[must_use = "the context frame is popped as soon as the guard is dropped"]
pub struct ContextGuard {
    depth: usize,
    id: ContextId,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextGuard {
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current merged metadata of this frame, including later annotations.
    #[must_use]
    pub fn metadata(&self) -> Map<String, Value> {
        FRAMES
            .with(|frames| {
                frames
                    .borrow()
                    .get(self.depth)
                    .map(|frame| frame.metadata.clone())
            })
            .unwrap_or_default()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = FRAMES.try_with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("depth", &self.depth)
            .field("id", &self.id)
            .finish()
    }
}

/// Pushes a frame carrying `metadata`.
pub fn enter<I, K>(metadata: I) -> ContextGuard
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let metadata: Map<String, Value> = metadata.into_iter().map(|(k, v)| (k.into(), v)).collect();
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let depth = frames.len();
        let frame = match frames.last() {
            Some(parent) => {
                let mut merged = parent.metadata.clone();
                merged.extend(metadata);
                ContextFrame {
                    id: parent.id,
                    metadata: merged,
                }
            }
            None => ContextFrame {
                id: ContextId::new(),
                metadata,
            },
        };
        let id = frame.id;
        frames.push(frame);
        tracing::trace!(context_id = %id, depth, "context entered");
        ContextGuard {
            depth,
            id,
            _thread_bound: PhantomData,
        }
    })
}

/// Runs `f` inside a frame carrying `metadata`.
pub fn scope<I, K, T>(metadata: I, f: impl FnOnce(&ContextGuard) -> T) -> T
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let guard = enter(metadata);
    f(&guard)
}

/// The innermost frame, if any.
#[must_use]
pub fn current() -> Option<ContextFrame> {
    FRAMES.with(|frames| frames.borrow().last().cloned())
}

#[must_use]
pub fn current_id() -> Option<ContextId> {
    FRAMES.with(|frames| frames.borrow().last().map(|frame| frame.id))
}

/// Merges `metadata` into the innermost frame. Returns false, changing
/// nothing, when no frame is active.
pub fn annotate<I, K>(metadata: I) -> bool
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    FRAMES.with(|frames| match frames.borrow_mut().last_mut() {
        Some(frame) => {
            frame
                .metadata
                .extend(metadata.into_iter().map(|(k, v)| (k.into(), v)));
            true
        }
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_frames_merge_and_keep_outer_id() {
        assert_eq!(current(), None);
        let outer = enter([("user", json!(1)), ("url", json!("/a"))]);
        {
            let inner = enter([("url", json!("/b"))]);
            assert_eq!(inner.id(), outer.id());
            let frame = current();
            assert_eq!(
                frame.map(|frame| Value::Object(frame.metadata)),
                Some(json!({"user": 1, "url": "/b"}))
            );
        }
        assert_eq!(
            current().map(|frame| Value::Object(frame.metadata)),
            Some(json!({"user": 1, "url": "/a"}))
        );
        drop(outer);
        assert_eq!(current(), None);
    }

    #[test]
    fn separate_outer_frames_get_fresh_ids() {
        let first = scope([("n", json!(1))], |guard| guard.id());
        let second = scope([("n", json!(2))], |guard| guard.id());
        assert_ne!(first, second);
        assert_eq!(current_id(), None);
    }

    #[test]
    fn panics_restore_the_previous_stack() {
        let outer = enter([("user", json!(7))]);
        let result = std::panic::catch_unwind(|| {
            let _inner = enter([("step", json!("boom"))]);
            panic!("inner failure");
        });
        assert!(result.is_err());
        assert_eq!(
            current().map(|frame| Value::Object(frame.metadata)),
            Some(json!({"user": 7}))
        );
        assert_eq!(current_id(), Some(outer.id()));
    }

    #[test]
    fn annotate_is_a_no_op_outside_a_frame() {
        assert!(!annotate([("user", json!(1))]));
        assert_eq!(current(), None);

        let guard = enter(Map::new());
        assert!(annotate([("user", json!(2))]));
        assert_eq!(Value::Object(guard.metadata()), json!({"user": 2}));
    }

    #[test]
    fn frames_do_not_leak_across_threads() {
        let _guard = enter([("user", json!("main"))]);
        let seen = std::thread::spawn(|| current().is_none()).join();
        assert!(matches!(seen, Ok(true)));
    }

    #[test]
    fn postgres_prelude_binds_uuid_and_json() {
        let frame = ContextFrame {
            id: ContextId(Ulid(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)),
            metadata: Map::from_iter([("user".to_string(), json!(1))]),
        };
        let (sql, params) = frame.postgres_prelude();
        assert!(sql.contains("set_config('pghistory.context_id', $1, true)"));
        assert_eq!(params[0], "01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(params[1], "{\"user\":1}");
    }
}
