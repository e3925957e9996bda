/// Raw output received since the last command boundary.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    buf: Vec<u8>,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the accumulated output as text, leaving the buffer empty.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn take_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        text
    }
}
