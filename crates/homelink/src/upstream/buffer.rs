use std::collections::VecDeque;

/// FIFO of serialized outbound frames held while the channel is not ready.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    queue: VecDeque<String>,
}

impl MessageBuffer {
    pub fn enqueue(&mut self, frame: String) {
        self.queue.push_back(frame);
    }

    /// Drain front to back while `sink` accepts frames.
    ///
    /// The first rejected frame stays at the front, so order is preserved
    /// for the next flush. Returns the number of frames delivered.
    pub fn flush<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut delivered = 0;
        while let Some(frame) = self.queue.front() {
            if !sink(frame) {
                break;
            }
            self.queue.pop_front();
            delivered += 1;
        }
        delivered
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
