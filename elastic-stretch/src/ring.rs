//! Sample ring buffers shared between the caller and the workers
//!
//! Every per-channel FIFO is a lock-free SPSC `HeapRb` split into a
//! producer half and a consumer half, so each half can live on the
//! thread that uses it.

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

pub type SampleProd = HeapProd<f32>;
pub type SampleCons = HeapCons<f32>;

/// Create an empty ring holding up to `capacity` samples
pub fn sample_ring(capacity: usize) -> (SampleProd, SampleCons) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

/// Non-consuming reads that zero-fill past the buffered data
pub trait PeekExt {
    /// Copy the oldest samples into `out` without consuming them.
    /// Returns how many were buffered; the rest of `out` is zeroed.
    fn peek_into(&self, out: &mut [f32]) -> usize;
}

impl PeekExt for SampleCons {
    fn peek_into(&self, out: &mut [f32]) -> usize {
        let (head, tail) = self.as_slices();
        let from_head = head.len().min(out.len());
        out[..from_head].copy_from_slice(&head[..from_head]);
        let from_tail = tail.len().min(out.len() - from_head);
        out[from_head..from_head + from_tail].copy_from_slice(&tail[..from_tail]);
        let got = from_head + from_tail;
        out[got..].fill(0.0);
        got
    }
}

/// Push up to `count` zero samples, returning how many fit
pub fn push_zeros(prod: &mut SampleProd, count: usize) -> usize {
    prod.push_iter(std::iter::repeat(0.0f32).take(count))
}

/// Drain everything buffered in `cons` into `prod`, returning the count moved
pub fn migrate(cons: &mut SampleCons, prod: &mut SampleProd) -> usize {
    let mut moved = 0;
    let mut scratch = [0.0f32; 1024];
    loop {
        let n = cons.pop_slice(&mut scratch);
        if n == 0 {
            break;
        }
        moved += prod.push_slice(&scratch[..n]);
    }
    moved
}
