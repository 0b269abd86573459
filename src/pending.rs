// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Time-ordered pending queue.
//
// The primary chain is threaded through `Header::next`, ordered ascending by
// target tick using the wrap-safe `tick_diff`. Events that share a target
// tick hang off the primary's `Header::sibling` field as a singly-linked
// stack: each newly-posted coincident event is pushed onto the front of that
// stack, so walking the stack front-to-back and finally visiting the primary
// itself yields dispatch order newest-posted-first, oldest-posted-last, with
// no separate reversal step needed.
//
// `Header::link` is the O(1) unqueue back-pointer: every node linked into
// this structure, whether on the primary chain or buried in a sibling
// stack, knows exactly which field points to it.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::header::{tick_diff, Header, Link};

pub(crate) struct PendingQueue {
    head: Option<NonNull<Header>>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert `node`, already carrying `target` in its `target` field, into
    /// the primary chain. Reuses an existing primary with an equal target by
    /// pushing `node` onto the front of its sibling stack.
    pub(crate) fn enqueue(&mut self, mut node: NonNull<Header>, target: u32) {
        unsafe {
            node.as_mut().target.store(target as i64, Ordering::Relaxed);
        }

        let mut pred: Option<NonNull<Header>> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let ctarget = unsafe { c.as_ref().target.load(Ordering::Relaxed) } as u32;
            if tick_diff(ctarget, target) >= 0 {
                break;
            }
            pred = Some(c);
            cursor = unsafe { c.as_ref().next };
        }

        match cursor {
            Some(mut landing)
                if unsafe { landing.as_ref().target.load(Ordering::Relaxed) } as u32 == target =>
            {
                // Same target as an existing primary: push onto its sibling stack.
                unsafe {
                    let old_head = landing.as_ref().sibling;
                    node.as_mut().next = None;
                    node.as_mut().sibling = old_head;
                    node.as_mut().link = Link::SiblingOf(landing);
                    if let Some(mut oh) = old_head {
                        oh.as_mut().link = Link::SiblingOf(node);
                    }
                    landing.as_mut().sibling = Some(node);
                }
            }
            landing => unsafe {
                node.as_mut().next = landing;
                node.as_mut().sibling = None;
                match pred {
                    Some(mut p) => {
                        node.as_mut().link = Link::NextOf(p);
                        p.as_mut().next = Some(node);
                    }
                    None => {
                        node.as_mut().link = Link::Head;
                        self.head = Some(node);
                    }
                }
                if let Some(mut l) = landing {
                    l.as_mut().link = Link::NextOf(node);
                }
            },
        }
    }

    /// Remove `node` from wherever it sits (primary chain or sibling stack)
    /// in O(1) using its `link` back-pointer. Returns `false` if `node` was
    /// already detached.
    pub(crate) fn unqueue(&mut self, mut node: NonNull<Header>) -> bool {
        let link = unsafe { node.as_ref().link };
        let next = unsafe { node.as_ref().next };
        let sibling = unsafe { node.as_ref().sibling };

        match link {
            Link::Detached => return false,
            Link::Head => unsafe {
                if let Some(mut sib) = sibling {
                    // Promote the sibling into the primary chain slot.
                    sib.as_mut().next = next;
                    sib.as_mut().link = Link::Head;
                    if let Some(mut n) = next {
                        n.as_mut().link = Link::NextOf(sib);
                    }
                    self.head = Some(sib);
                } else {
                    self.head = next;
                    if let Some(mut n) = next {
                        n.as_mut().link = Link::Head;
                    }
                }
            },
            Link::NextOf(mut pred) => unsafe {
                if let Some(mut sib) = sibling {
                    sib.as_mut().next = next;
                    sib.as_mut().link = Link::NextOf(pred);
                    pred.as_mut().next = Some(sib);
                    if let Some(mut n) = next {
                        n.as_mut().link = Link::NextOf(sib);
                    }
                } else {
                    pred.as_mut().next = next;
                    if let Some(mut n) = next {
                        n.as_mut().link = Link::NextOf(pred);
                    }
                }
            },
            Link::SiblingOf(mut pred) => unsafe {
                pred.as_mut().sibling = sibling;
                if let Some(mut s) = sibling {
                    s.as_mut().link = Link::SiblingOf(pred);
                }
            },
        }

        unsafe {
            node.as_mut().next = None;
            node.as_mut().sibling = None;
            node.as_mut().link = Link::Detached;
        }
        true
    }

    /// Detach every group whose target has reached or passed `now`, in
    /// dispatch order (newest-posted-first within each tick). Returns the
    /// detached nodes and the next deadline, if any events remain.
    pub(crate) fn dequeue_due(&mut self, now: u32) -> (Vec<NonNull<Header>>, Option<u32>) {
        let mut due = Vec::new();

        while let Some(primary) = self.head {
            let target = unsafe { primary.as_ref().target.load(Ordering::Relaxed) } as u32;
            if tick_diff(target, now) > 0 {
                break;
            }

            let next = unsafe { primary.as_ref().next };
            self.head = next;
            if let Some(mut n) = next {
                unsafe {
                    n.as_mut().link = Link::Head;
                }
            }

            let mut cursor = unsafe { primary.as_ref().sibling };
            while let Some(s) = cursor {
                cursor = unsafe { s.as_ref().sibling };
                due.push(s);
            }
            due.push(primary);
        }

        for mut node in due.iter().copied() {
            unsafe {
                node.as_mut().next = None;
                node.as_mut().sibling = None;
                node.as_mut().link = Link::Detached;
            }
        }

        let next_deadline = self
            .head
            .map(|h| unsafe { h.as_ref().target.load(Ordering::Relaxed) } as u32);
        (due, next_deadline)
    }

    /// Detach every node still linked in, primary and sibling alike,
    /// regardless of target. Used when the queue itself is torn down and
    /// outstanding destructors still need to run.
    pub(crate) fn drain_all(&mut self) -> Vec<NonNull<Header>> {
        let mut all = Vec::new();
        let mut cursor = self.head.take();
        while let Some(primary) = cursor {
            cursor = unsafe { primary.as_ref().next };

            let mut sib_cursor = unsafe { primary.as_ref().sibling };
            while let Some(s) = sib_cursor {
                sib_cursor = unsafe { s.as_ref().sibling };
                all.push(s);
            }
            all.push(primary);
        }

        for mut node in all.iter().copied() {
            unsafe {
                node.as_mut().next = None;
                node.as_mut().sibling = None;
                node.as_mut().link = Link::Detached;
            }
        }
        all
    }
}
