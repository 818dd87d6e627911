use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::MesherWork;

/// Byte-budgeted multi-producer, single-consumer queue feeding the mesher.
///
/// Mesh fragments vary wildly in size, so this queue bounds bytes rather
/// than items; a fragment larger than the whole budget is still admitted on
/// its own so progress never wedges.
pub struct MesherQueue {
    state: Mutex<State>,
    space: Condvar,
    ready: Condvar,
    budget: usize,
}

struct State {
    items: VecDeque<MesherWork>,
    bytes: usize,
    closed: bool,
}

impl MesherQueue {
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            space: Condvar::new(),
            ready: Condvar::new(),
            budget,
        }
    }

    /// Blocks while the queue is over budget.
    pub fn push(&self, work: MesherWork) {
        let bytes = work.mesh.host_bytes();
        let mut state = self.state.lock().expect("mesher queue poisoned");
        while !state.items.is_empty() && state.bytes + bytes > self.budget {
            state = self.space.wait(state).expect("mesher queue poisoned");
        }
        debug_assert!(!state.closed, "push after close");
        state.bytes += bytes;
        state.items.push_back(work);
        self.ready.notify_one();
    }

    /// Blocks until an item arrives; `None` after close once drained.
    pub fn pop(&self) -> Option<MesherWork> {
        let mut state = self.state.lock().expect("mesher queue poisoned");
        loop {
            if let Some(work) = state.items.pop_front() {
                state.bytes -= work.mesh.host_bytes();
                self.space.notify_all();
                return Some(work);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).expect("mesher queue poisoned");
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("mesher queue poisoned");
        state.closed = true;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use splatmesh_core::{ChunkId, KeyMesh};

    fn work(vertices: usize) -> MesherWork {
        MesherWork {
            chunk: ChunkId::default(),
            mesh: KeyMesh {
                vertices: vec![Vec3::ZERO; vertices],
                vertex_keys: Vec::new(),
                triangles: Vec::new(),
                num_internal: vertices,
            },
        }
    }

    #[test]
    fn drains_in_fifo_order_after_close() {
        let queue = MesherQueue::new(1 << 20);
        queue.push(work(1));
        queue.push(work(2));
        queue.close();
        assert_eq!(queue.pop().unwrap().mesh.vertices.len(), 1);
        assert_eq!(queue.pop().unwrap().mesh.vertices.len(), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn blocks_producers_over_budget() {
        let queue = std::sync::Arc::new(MesherQueue::new(64));
        queue.push(work(100)); // oversized item admitted alone

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.push(work(1)); // must wait for the consumer
                queue.close();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(queue.pop().unwrap().mesh.vertices.len(), 100);
        assert_eq!(queue.pop().unwrap().mesh.vertices.len(), 1);
        producer.join().unwrap();
        assert!(queue.pop().is_none());
    }
}
