//! Collection of unreachable subscriptions.
//!
//! When a subscription loses its last direct subscriber, it and the
//! resources it references may still be held by other subscriptions. The
//! references form a graph that may contain cycles, so plain reference
//! counting cannot tell when a group of subscriptions only references
//! itself. `try_delete` runs two traversals from the released subscription:
//!
//! 1. Count how many of each node's indirect references come from inside
//!    the reachable graph. A node with references left over is held from
//!    the outside.
//! 2. Mark every node held from the outside, and everything below it, to be
//!    kept. The rest is disposed.
//!
//! Nodes with direct subscriptions are roots of their own and never entered.
//!
//! If the released subscription had been sent, the client drops it along
//! with everything it only reached through it. Kept nodes that are no
//! longer reachable from a sent subscription outside the graph are
//! therefore unsent, so the next snapshot that includes them carries them
//! again.

use super::{ConnState, SubId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    None,
    Delete,
    Keep,
    Stop,
}

#[derive(Debug)]
struct Node {
    /// Indirect references not yet accounted for by the traversal.
    indirect: isize,
    mark: Mark,
}

impl ConnState {
    /// Dispose the subscription if nothing holds it, together with any
    /// referenced subscription only reachable through it.
    pub(super) fn try_delete(&mut self, id: SubId) {
        let Some(root) = self.subscriptions.get(&id) else { return };
        if root.direct > 0 {
            return;
        }
        let sent = root.is_sent();

        let mut nodes: HashMap<SubId, Node> = HashMap::new();
        nodes.insert(
            id,
            Node {
                indirect: root.indirect as isize,
                mark: Mark::None,
            },
        );

        self.traverse(id, Mark::None, true, &mut |st, sid, _| {
            if let Some(n) = nodes.get_mut(&sid) {
                n.indirect -= 1;
                return Mark::Stop;
            }
            let indirect = st.subscriptions.get(&sid).map_or(0, |s| s.indirect as isize);
            nodes.insert(
                sid,
                Node {
                    indirect: indirect - 1,
                    mark: Mark::None,
                },
            );
            Mark::None
        });

        if !sent && nodes.get(&id).is_some_and(|n| n.indirect > 0) {
            return;
        }

        self.traverse(id, Mark::None, false, &mut |_, sid, parent| {
            let Some(n) = nodes.get_mut(&sid) else { return Mark::Stop };
            if n.mark == Mark::Keep {
                return Mark::Stop;
            }
            if n.indirect > 0 || parent == Mark::Keep {
                n.mark = Mark::Keep;
                return Mark::Keep;
            }
            if n.mark != Mark::None {
                return Mark::Stop;
            }
            n.mark = Mark::Delete;
            Mark::Delete
        });

        let mut delete = Vec::new();
        let mut kept = Vec::new();
        for (sid, n) in nodes {
            if n.mark == Mark::Delete {
                delete.push(sid);
            } else {
                kept.push(sid);
            }
        }
        let mut orphaned = Vec::new();
        for &sid in &delete {
            orphaned.extend(self.dispose_sub(sid));
        }
        self.remove_disposed(&delete, orphaned);

        if sent {
            self.unsend_unreachable(kept);
        }
    }

    /// Unsend every sent node in `kept` that no sent subscription outside
    /// the set still reaches.
    fn unsend_unreachable(&mut self, kept: Vec<SubId>) {
        let candidates: HashSet<SubId> = kept
            .into_iter()
            .filter(|sid| self.subscriptions.get(sid).is_some_and(|s| s.is_sent()))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let mut reached: HashSet<SubId> = HashSet::new();
        let mut stack: Vec<SubId> = self
            .subscriptions
            .iter()
            .filter(|(pid, p)| p.is_sent() && !candidates.contains(*pid))
            .flat_map(|(_, p)| p.references())
            .filter(|sid| candidates.contains(sid))
            .collect();
        while let Some(sid) = stack.pop() {
            if !reached.insert(sid) {
                continue;
            }
            if let Some(sub) = self.subscriptions.get(&sid) {
                stack.extend(sub.references().filter(|c| candidates.contains(c)));
            }
        }

        for sid in candidates.difference(&reached) {
            self.unsend(*sid);
        }
    }

    fn traverse<F>(&self, id: SubId, mark: Mark, skip_root: bool, cb: &mut F)
    where
        F: FnMut(&ConnState, SubId, Mark) -> Mark,
    {
        let Some(sub) = self.subscriptions.get(&id) else { return };
        if sub.direct > 0 {
            return;
        }
        let mut mark = mark;
        if !skip_root {
            mark = cb(self, id, mark);
            if mark == Mark::Stop {
                return;
            }
        }
        let refs: Vec<SubId> = sub.references().collect();
        for child in refs {
            self.traverse(child, mark, false, cb);
        }
    }
}
