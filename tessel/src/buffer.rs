//! Reference-counted copy-on-write storage behind lists, strings, maps and
//! records.
//!
//! A [`Buffer`] only hands out `&mut` access through [`Buffer::touch`], which
//! first makes the buffer exclusively owned. Two cells that share a buffer
//! can therefore never observe each other's mutations.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

thread_local! {
    static LIVE_BUFFERS: Cell<usize> = const { Cell::new(0) };
}

/// Number of buffers currently alive that were allocated on this thread.
///
/// Buffers dropped on another thread than the one that created them are
/// counted against the dropping thread.
pub fn live_buffers() -> usize {
    LIVE_BUFFERS.with(Cell::get)
}

struct Tracked<T> {
    payload: T,
}

impl<T> Tracked<T> {
    fn new(payload: T) -> Self {
        LIVE_BUFFERS.with(|live| live.set(live.get() + 1));
        Self { payload }
    }
}

impl<T: Clone> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self::new(self.payload.clone())
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        LIVE_BUFFERS.with(|live| live.set(live.get().saturating_sub(1)));
    }
}

pub struct Buffer<T> {
    inner: Arc<Tracked<T>>,
}

impl<T: Clone> Buffer<T> {
    pub fn new(payload: T) -> Self {
        Self {
            inner: Arc::new(Tracked::new(payload)),
        }
    }

    /// Number of cells sharing this buffer. Always at least 1.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn get(&self) -> &T {
        &self.inner.payload
    }

    /// Obtain exclusive ownership and return the payload for mutation.
    ///
    /// A shared buffer is duplicated into a fresh one with a refcount of 1,
    /// dropping this handle's reference to the original. An exclusively owned
    /// buffer is mutated in place.
    pub fn touch(&mut self) -> &mut T {
        &mut Arc::make_mut(&mut self.inner).payload
    }

    pub fn is_shared(&self) -> bool {
        self.refcount() > 1
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.payload.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_share_until_touched() {
        let a = Buffer::new(vec![1, 2, 3]);
        let mut b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert!(a.ptr_eq(&b));

        b.touch()[0] = 10;

        assert!(!a.ptr_eq(&b));
        assert_eq!(a.refcount(), 1);
        assert_eq!(b.refcount(), 1);
        assert_eq!(a.get(), &vec![1, 2, 3]);
        assert_eq!(b.get(), &vec![10, 2, 3]);
    }

    #[test]
    fn exclusive_touch_mutates_in_place() {
        let mut a = Buffer::new(String::from("ab"));
        let before = live_buffers();
        a.touch().push('c');
        assert_eq!(live_buffers(), before);
        assert_eq!(a.get(), "abc");
    }

    #[test]
    fn live_count_follows_reachability() {
        let base = live_buffers();
        let a = Buffer::new(vec![0u8; 4]);
        let b = a.clone();
        let mut c = b.clone();
        assert_eq!(live_buffers(), base + 1);

        c.touch().push(1);
        assert_eq!(live_buffers(), base + 2);

        drop(a);
        assert_eq!(live_buffers(), base + 2);
        drop(b);
        assert_eq!(live_buffers(), base + 1);
        drop(c);
        assert_eq!(live_buffers(), base);
    }
}
