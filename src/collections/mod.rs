//! The small owned containers backing the pool's indices: a FIFO queue for
//! wait lists, a min-heap for priority scheduling and a bounded ring for the
//! idle-worker list.

mod fifo;
mod heap;
mod ring;

pub use fifo::Queue;
pub use heap::PriorityQueue;
pub use ring::RingBuffer;
