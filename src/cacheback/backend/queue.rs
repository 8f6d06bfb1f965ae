//! The per-backend in-flight request queue.
//!
//! Requests are stored in a `slab::Slab` and linked into a singly-linked FIFO
//! via an index stored on each entry, rather than boxed linked-list nodes.
//! `head` is the oldest request not yet fully *read* (a response not yet
//! parsed for it); `io_next` is the oldest request not yet fully *written*.
//! Both cursors are slab indices, so "is this node currently linked" is just
//! `Option::is_some()` and there is never a dangling pointer to chase.

use bytes::Bytes;
use slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Ok,
    Error,
}

/// The response being assembled for one request.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    pub status: Option<RequestStatus>,
    /// Accumulated response bytes: header, value (if any), and for GET the
    /// trailing `END\r\n` literal.
    pub buf: Vec<u8>,
    /// Value bytes still to be copied in;
    /// zero once the current value is fully copied or there is none.
    pub value_remaining: usize,
    /// True for GET responses, which are followed by a separate `END\r\n`
    /// literal; false for every other response kind.
    pub awaiting_end_literal: bool,
}

/// One in-flight request submitted to a backend.
pub struct Request {
    /// Gather vector of request bytes not yet fully written.
    pub iov: Vec<Bytes>,
    pub iovbytes: usize,
    pub response: ResponseSlot,
    pub flushed: bool,
    pub await_background: bool,
    pub ascii_multiget: bool,
    /// Monotonic submission order, used only to check that completions come
    /// back in non-decreasing submission order.
    pub submission_index: u64,
    /// True only for the internal `version\r\n` probe a backend pushes onto
    /// its own queue during validation; never delivered to a sink.
    pub is_validation: bool,
    next: Option<usize>,
}

impl Request {
    pub fn new(iov: Vec<Bytes>, ascii_multiget: bool, await_background: bool, submission_index: u64) -> Self {
        let iovbytes = iov.iter().map(Bytes::len).sum();
        Request {
            iov,
            iovbytes,
            response: ResponseSlot::default(),
            flushed: await_background,
            await_background,
            ascii_multiget,
            submission_index,
            is_validation: false,
            next: None,
        }
    }
}

/// The external completion interface: invoked exactly once per
/// non-`await_background` request, whether it completed normally or was
/// purged by a backend reset. Submitting worker threads are out of this
/// core's scope, so callers supply whatever sink fits — a
/// channel, a callback list, or (in tests) a `Vec` collector.
pub trait CompletionSink {
    fn return_io_pending(&self, req: Request);
}

/// An intrusive FIFO of `Request`s backed by a slab.
#[derive(Default)]
pub struct RequestQueue {
    slab: Slab<Request>,
    head: Option<usize>,
    tail: Option<usize>,
    io_next: Option<usize>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn io_next_index(&self) -> Option<usize> {
        self.io_next
    }

    /// Pushes a request onto the tail of the queue, returning its slab index.
    /// If the queue had no write cursor (every prior request already
    /// flushed), the new request becomes the write cursor.
    pub fn push(&mut self, req: Request) -> usize {
        let already_flushed = req.flushed;
        let idx = self.slab.insert(req);
        if let Some(tail) = self.tail {
            self.slab[tail].next = Some(idx);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        if self.io_next.is_none() && !already_flushed {
            self.io_next = Some(idx);
        }
        idx
    }

    pub fn head(&self) -> Option<&Request> {
        self.head.map(|idx| &self.slab[idx])
    }

    pub fn head_mut(&mut self) -> Option<&mut Request> {
        self.head.map(move |idx| &mut self.slab[idx])
    }

    pub fn get(&self, idx: usize) -> &Request {
        &self.slab[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Request {
        &mut self.slab[idx]
    }

    /// Pops and returns the head request, e.g. once its response has been
    /// fully parsed and handed back via the completion callback.
    pub fn pop_head(&mut self) -> Option<Request> {
        let idx = self.head?;
        let req = self.slab.remove(idx);
        self.head = req.next;
        if self.head.is_none() {
            self.tail = None;
        }
        if self.io_next == Some(idx) {
            self.io_next = req.next;
        }
        Some(req)
    }

    /// Advances the write cursor past `idx` once that request is fully flushed.
    pub fn advance_io_next_past(&mut self, idx: usize) {
        if self.io_next == Some(idx) {
            self.io_next = self.slab[idx].next;
        }
    }

    /// Walks the write cursor chain, yielding (slab index, &Request) pairs
    /// starting at `io_next`, for the write-flush gather build.
    pub fn iter_from_io_next(&self) -> QueueIter<'_> {
        QueueIter { queue: self, cur: self.io_next }
    }

    /// Drains every request in the queue, in head-to-tail order, resetting
    /// the queue to empty — the purge step of a backend reset.
    pub fn drain_all(&mut self) -> Vec<Request> {
        let mut out = Vec::with_capacity(self.depth());
        while let Some(req) = self.pop_head() {
            out.push(req);
        }
        self.head = None;
        self.tail = None;
        self.io_next = None;
        out
    }
}

pub struct QueueIter<'a> {
    queue: &'a RequestQueue,
    cur: Option<usize>,
}

impl<'a> Iterator for QueueIter<'a> {
    type Item = (usize, &'a Request);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cur?;
        let req = &self.queue.slab[idx];
        self.cur = req.next;
        Some((idx, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(bytes: &'static [u8], submission_index: u64) -> Request {
        Request::new(vec![Bytes::from_static(bytes)], false, false, submission_index)
    }

    #[test]
    fn push_sets_io_next_to_first_unflushed() {
        let mut q = RequestQueue::new();
        assert!(q.io_next_index().is_none());
        let idx = q.push(req(b"get a\r\n", 0));
        assert_eq!(q.io_next_index(), Some(idx));
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn pop_head_advances_io_next_if_it_pointed_at_head() {
        let mut q = RequestQueue::new();
        let a = q.push(req(b"get a\r\n", 0));
        let b = q.push(req(b"get b\r\n", 1));
        assert_eq!(q.io_next_index(), Some(a));
        q.pop_head();
        assert_eq!(q.depth(), 1);
        assert_eq!(q.head().unwrap().submission_index, 1);
        // io_next never pointed past `a` in this test, so it's untouched by the pop
        // unless it was at `a`'s slot.
        let _ = b;
    }

    #[test]
    fn drain_all_empties_queue() {
        let mut q = RequestQueue::new();
        q.push(req(b"get a\r\n", 0));
        q.push(req(b"get b\r\n", 1));
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
        assert!(q.io_next_index().is_none());
        assert_eq!(q.depth(), 0);
    }
}
