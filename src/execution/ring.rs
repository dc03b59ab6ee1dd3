/// Growable FIFO ring used as the mailbox of a per-edge transport and as the
/// dispatcher's work queue. Pushing into a full ring doubles its capacity and
/// lays the elements out again starting at index 0.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> RingBuffer<T> {
        let mut buf = Vec::with_capacity(capacity.max(1));
        buf.resize_with(capacity.max(1), || None);
        RingBuffer { buf, head: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, value: T) {
        if self.len == self.buf.len() {
            self.grow();
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = Some(value);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        value
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
    }

    // Only called when full: [head..] followed by [..head] becomes the new front.
    fn grow(&mut self) {
        let new_cap = self.buf.len() * 2;
        let mut buf: Vec<Option<T>> = Vec::with_capacity(new_cap);
        buf.extend(self.buf.drain(self.head..));
        buf.extend(self.buf.drain(..));
        buf.resize_with(new_cap, || None);
        self.buf = buf;
        self.head = 0;
    }
}
