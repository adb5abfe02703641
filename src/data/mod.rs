//! Data handling: frame buffering between producers and consumers.

pub mod ring_buffer;

pub use ring_buffer::RingBuffer;
