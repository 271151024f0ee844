use std::io;
use std::os::unix::io::RawFd;

use crate::sys;

/// A growable byte buffer with a cheap-prepend reserve and scatter reads.
///
/// Layout:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=    capacity
/// ```
///
/// Appends grow the writable region by first reclaiming the prepend slack
/// and only then reallocating. [`read_fd`] fills the buffer from a
/// descriptor with a single `readv`, spilling into a stack extent so one
/// syscall can collect more than the currently writable region.
///
/// [`read_fd`]: Buffer::read_fd
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

/// Stack extent used by `read_fd`.
const EXTRA_BUF_SIZE: usize = 65536;

impl Buffer {
    pub const CHEAP_PREPEND: usize = 8;
    pub const INITIAL_SIZE: usize = 1024;

    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            data: vec![0; Buffer::CHEAP_PREPEND + initial],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Insert `data` in front of the readable region, using the prepend
    /// reserve.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.data[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_bytes(len)
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    pub fn append_u16(&mut self, val: u16) {
        self.append(&val.to_be_bytes());
    }

    pub fn append_u32(&mut self, val: u32) {
        self.append(&val.to_be_bytes());
    }

    pub fn append_u64(&mut self, val: u64) {
        self.append(&val.to_be_bytes());
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u16(&mut self) -> u16 {
        let val = self.peek_u16();
        self.retrieve(2);
        val
    }

    pub fn read_u32(&mut self) -> u32 {
        let val = self.peek_u32();
        self.retrieve(4);
        val
    }

    pub fn read_u64(&mut self) -> u64 {
        let val = self.peek_u64();
        self.retrieve(8);
        val
    }

    pub fn prepend_u16(&mut self, val: u16) {
        self.prepend(&val.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, val: u32) {
        self.prepend(&val.to_be_bytes());
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    /// Shed excess capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut data = vec![0; Buffer::CHEAP_PREPEND + readable + reserve];
        data[Buffer::CHEAP_PREPEND..Buffer::CHEAP_PREPEND + readable].copy_from_slice(self.peek());
        self.data = data;
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND + readable;
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Buffer::CHEAP_PREPEND {
            self.data.resize(self.writer_index + len, 0);
        } else {
            // Enough slack in front; move the readable region back to the
            // prepend mark instead of reallocating.
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Fill the buffer from `fd` with one scatter read.
    ///
    /// A second `readv` segment on the stack lets a single syscall pull in
    /// up to 64 KiB beyond the writable region; whatever lands there is
    /// appended afterwards.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let head = &mut self.data[self.writer_index..];
            sys::readv2(fd, head, &mut extra)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.data.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn initial_state() {
        let buffer = Buffer::new();
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn append_and_retrieve() {
        let mut buffer = Buffer::new();
        let data = b"Hello, World!";

        buffer.append(data);
        assert_eq!(buffer.readable_bytes(), data.len());

        let result = buffer.retrieve_as_string(data.len());
        assert_eq!(result.as_bytes(), data);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn multiple_append() {
        let mut buffer = Buffer::new();
        buffer.append(b"Hello, ");
        buffer.append(b"World!");

        assert_eq!(buffer.readable_bytes(), 13);
        assert_eq!(buffer.retrieve_all_as_string(), "Hello, World!");
    }

    #[test]
    fn partial_retrieve() {
        let mut buffer = Buffer::new();
        buffer.append(b"Hello, World!");

        buffer.retrieve(7);
        assert_eq!(buffer.readable_bytes(), 6);
        assert_eq!(buffer.retrieve_all_as_string(), "World!");
    }

    #[test]
    fn find_crlf() {
        let mut buffer = Buffer::new();
        buffer.append(b"Line1\r\nLine2\r\n");
        assert_eq!(buffer.find_crlf(), Some(5));

        buffer.retrieve(7);
        assert_eq!(buffer.find_crlf(), Some(5));
    }

    #[test]
    fn find_eol() {
        let mut buffer = Buffer::new();
        buffer.append(b"Line1\nLine2\n");
        assert_eq!(buffer.find_eol(), Some(5));
    }

    #[test]
    fn network_byte_order() {
        let mut buffer = Buffer::new();
        buffer.append_u32(0x12345678);

        assert_eq!(buffer.readable_bytes(), 4);
        assert_eq!(buffer.peek(), &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(buffer.peek_u32(), 0x12345678);
        assert_eq!(buffer.read_u32(), 0x12345678);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn prepend() {
        let mut buffer = Buffer::new();
        buffer.append(b"World!");
        buffer.prepend(b"Hi, ");
        assert_eq!(buffer.retrieve_all_as_string(), "Hi, World!");
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn prepend_u32() {
        let mut buffer = Buffer::new();
        buffer.append(b"data");
        buffer.prepend_u32(0x12345678);

        assert_eq!(buffer.readable_bytes(), 8);
        assert_eq!(buffer.peek_u32(), 0x12345678);
    }

    #[test]
    fn swap() {
        let mut buffer1 = Buffer::new();
        let mut buffer2 = Buffer::new();

        buffer1.append(b"Buffer1");
        buffer2.append(b"Buffer2");
        buffer1.swap(&mut buffer2);

        assert_eq!(buffer1.retrieve_all_as_string(), "Buffer2");
        assert_eq!(buffer2.retrieve_all_as_string(), "Buffer1");
    }

    #[test]
    fn grows_on_large_append() {
        let mut buffer = Buffer::new();
        let large = vec![b'A'; 10000];

        buffer.append(&large);
        assert_eq!(buffer.readable_bytes(), 10000);
        assert_eq!(buffer.retrieve_all_as_bytes(), large);
    }

    #[test]
    fn reclaims_prepend_slack() {
        let mut buffer = Buffer::new();
        buffer.append(&vec![b'x'; Buffer::INITIAL_SIZE - 100]);
        buffer.retrieve(800);
        let capacity_before = buffer.writable_bytes() + buffer.readable_bytes()
            + buffer.prependable_bytes();

        // Fits only after moving the readable region back to the front.
        buffer.append(&vec![b'y'; 700]);
        let capacity_after = buffer.writable_bytes() + buffer.readable_bytes()
            + buffer.prependable_bytes();

        assert_eq!(capacity_before, capacity_after);
        assert_eq!(buffer.readable_bytes(), Buffer::INITIAL_SIZE - 900 + 700);
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn shrink_keeps_content() {
        let mut buffer = Buffer::new();
        buffer.append(&vec![b'z'; 4000]);
        buffer.retrieve(3990);

        buffer.shrink(16);
        assert_eq!(buffer.readable_bytes(), 10);
        assert_eq!(buffer.writable_bytes(), 16);
        assert_eq!(buffer.retrieve_all_as_bytes(), vec![b'z'; 10]);
    }

    #[test]
    fn append_retrieve_round_trip_restores_state() {
        let mut buffer = Buffer::new();
        buffer.append(b"seed");
        let before = buffer.readable_bytes();

        let data = "\u{6d4b}\u{8bd5}\u{4e2d}\u{6587}";
        buffer.append(data.as_bytes());
        assert_eq!(buffer.retrieve_as_string(data.len()), data);
        assert_eq!(buffer.readable_bytes(), before);
    }
}
