//! The work queue (C5): a FIFO the receive worker and the connection manager
//! produce into, and the dispatch worker blocks on.
//!
//! Items interleave in strict insertion order regardless of kind — a META
//! posted between two PACKETs is delivered between them. Any number of
//! producers is safe; there is exactly one consumer (the dispatch worker).
//! A plain `Mutex<VecDeque>` + `Condvar`, not a lock-free ring: callers here
//! need to *block* until an item shows up rather than spin.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

use crate::types::{ConnectReason, DisconnectReason};

#[derive(Debug, Clone)]
pub enum MetaEvent {
    Connected { reason: ConnectReason },
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Tells the dispatch worker to drain and exit.
    Exit,
    Meta(MetaEvent),
    /// A raw event frame payload (header stripped) ready for dispatch.
    Packet(Vec<u8>),
}

#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an item and wakes one waiting consumer.
    pub fn put(&self, item: WorkItem) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.available.notify_one();
    }

    /// Blocks until an item is available, then pops and returns it.
    pub fn get(&self) -> WorkItem {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.available.wait(items).unwrap();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_order_preserved_across_kinds() {
        let q = WorkQueue::new();
        q.put(WorkItem::Packet(vec![1]));
        q.put(WorkItem::Meta(MetaEvent::Connected { reason: ConnectReason::Request }));
        q.put(WorkItem::Packet(vec![2]));

        assert!(matches!(q.get(), WorkItem::Packet(p) if p == vec![1]));
        assert!(matches!(q.get(), WorkItem::Meta(MetaEvent::Connected { .. })));
        assert!(matches!(q.get(), WorkItem::Packet(p) if p == vec![2]));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn get_blocks_until_put() {
        let q = Arc::new(WorkQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.get());

        thread::sleep(Duration::from_millis(50));
        q.put(WorkItem::Exit);

        let item = handle.join().unwrap();
        assert!(matches!(item, WorkItem::Exit));
    }

    #[test]
    fn multi_producer_single_consumer() {
        let q = Arc::new(WorkQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|n| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        q.put(WorkItem::Packet(vec![n, i]));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(q.len(), 100);
    }
}
