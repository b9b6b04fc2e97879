//! Outbound datagram coalescing.
//!
//! Four strategies behind one interface: one-packet-per-send, GSO runs of
//! equal-sized segments, independent packets via sendmmsg, and sendmmsg of
//! GSO runs. The factory downgrades GSO modes when the kernel lacks
//! `UDP_SEGMENT`.

pub mod socket;

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::warn;

use crate::settings::QuicBatchingMode;

pub use socket::{create_udp_socket, QuicUdpSocket, StdUdpSocket};

/// Common contract of all batch writers.
///
/// `append` returns true when this packet filled the batch and the caller
/// must flush before the next append. `needs_flush` asks whether appending a
/// packet of the given length would break batching constraints. After
/// `reset`, `empty()` holds and `size()` is zero.
pub trait BatchWriter {
    /// True when no buffers are held.
    fn empty(&self) -> bool;

    /// Bytes currently buffered.
    fn size(&self) -> usize;

    /// Drops buffered state without sending.
    fn reset(&mut self);

    fn needs_flush(&self, _size: usize) -> bool {
        false
    }

    /// Takes ownership of one packet's bytes; true means "flush now".
    fn append(&mut self, buf: Bytes, size: usize) -> bool;

    /// Emits all buffered datagrams and empties state.
    fn flush(&mut self, socket: &dyn QuicUdpSocket, addr: SocketAddr) -> io::Result<usize>;
}

/// One packet per send call.
#[derive(Default)]
pub struct SinglePacketBatchWriter {
    buf: Option<Bytes>,
}

impl SinglePacketBatchWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchWriter for SinglePacketBatchWriter {
    fn empty(&self) -> bool {
        self.buf.is_none()
    }

    fn size(&self) -> usize {
        self.buf.as_ref().map_or(0, Bytes::len)
    }

    fn reset(&mut self) {
        self.buf = None;
    }

    fn append(&mut self, buf: Bytes, _size: usize) -> bool {
        self.buf = Some(buf);
        // Always flush immediately.
        true
    }

    fn flush(&mut self, socket: &dyn QuicUdpSocket, addr: SocketAddr) -> io::Result<usize> {
        let Some(buf) = self.buf.take() else {
            return Ok(0);
        };
        socket.write(addr, &buf)
    }
}

/// A run of equal-sized segments the kernel splits with GSO. A smaller last
/// segment is permitted but ends the run; a larger packet forces a flush
/// first.
pub struct GsoPacketBatchWriter {
    max_bufs: usize,
    bufs: Vec<Bytes>,
    curr_size: usize,
    prev_size: usize,
    /// A shorter tail segment was appended; nothing more may join this run.
    run_closed: bool,
}

impl GsoPacketBatchWriter {
    pub fn new(max_bufs: usize) -> Self {
        Self {
            max_bufs,
            bufs: Vec::with_capacity(max_bufs),
            curr_size: 0,
            prev_size: 0,
            run_closed: false,
        }
    }
}

impl BatchWriter for GsoPacketBatchWriter {
    fn empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn size(&self) -> usize {
        self.curr_size
    }

    fn reset(&mut self) {
        self.bufs.clear();
        self.curr_size = 0;
        self.prev_size = 0;
        self.run_closed = false;
    }

    fn needs_flush(&self, size: usize) -> bool {
        // Only the last segment of a run may be shorter than its
        // predecessors; a bigger one cannot join, and a closed run admits
        // nothing further.
        self.run_closed || (self.prev_size > 0 && size > self.prev_size)
    }

    fn append(&mut self, buf: Bytes, size: usize) -> bool {
        if self.bufs.is_empty() {
            self.bufs.push(buf);
            self.curr_size = size;
            self.prev_size = size;
            return false;
        }

        debug_assert!(size <= self.prev_size, "caller must check needs_flush");
        self.bufs.push(buf);
        self.curr_size += size;

        // A shorter segment closes the run.
        if size != self.prev_size {
            self.run_closed = true;
            return true;
        }
        if self.bufs.len() == self.max_bufs {
            return true;
        }
        false
    }

    fn flush(&mut self, socket: &dyn QuicUdpSocket, addr: SocketAddr) -> io::Result<usize> {
        let result = if self.bufs.len() > 1 {
            socket.write_gso(addr, &self.bufs, self.prev_size)
        } else if let Some(buf) = self.bufs.first() {
            socket.write(addr, buf)
        } else {
            Ok(0)
        };
        self.reset();
        result
    }
}

/// Independent packets of any size batched into one sendmmsg.
pub struct SendmmsgPacketBatchWriter {
    max_bufs: usize,
    curr_size: usize,
    bufs: Vec<Bytes>,
}

impl SendmmsgPacketBatchWriter {
    pub fn new(max_bufs: usize) -> Self {
        Self {
            max_bufs,
            curr_size: 0,
            bufs: Vec::with_capacity(max_bufs),
        }
    }
}

impl BatchWriter for SendmmsgPacketBatchWriter {
    fn empty(&self) -> bool {
        self.curr_size == 0
    }

    fn size(&self) -> usize {
        self.curr_size
    }

    fn reset(&mut self) {
        self.bufs.clear();
        self.curr_size = 0;
    }

    fn append(&mut self, buf: Bytes, size: usize) -> bool {
        debug_assert!(self.bufs.len() < self.max_bufs);
        self.bufs.push(buf);
        self.curr_size += size;
        self.bufs.len() == self.max_bufs
    }

    fn flush(&mut self, socket: &dyn QuicUdpSocket, addr: SocketAddr) -> io::Result<usize> {
        let result = if self.bufs.len() == 1 {
            socket.write(addr, &self.bufs[0])
        } else if self.bufs.is_empty() {
            Ok(0)
        } else {
            let sent = socket.writem(addr, &self.bufs)?;
            // A partial sendmmsg reports success for what went out; report a
            // size mismatch so the caller notices.
            if sent == self.bufs.len() {
                Ok(self.curr_size)
            } else {
                Ok(0)
            }
        };
        self.reset();
        result
    }
}

/// Several GSO runs batched into one sendmmsg. Each run follows the GSO
/// equal-segment rule; a larger packet starts a new run.
pub struct SendmmsgGsoPacketBatchWriter {
    max_bufs: usize,
    curr_bufs: usize,
    curr_size: usize,
    prev_size: usize,
    chains: Vec<Vec<Bytes>>,
    gso: Vec<usize>,
}

impl SendmmsgGsoPacketBatchWriter {
    pub fn new(max_bufs: usize) -> Self {
        Self {
            max_bufs,
            curr_bufs: 0,
            curr_size: 0,
            prev_size: 0,
            chains: Vec::new(),
            gso: Vec::new(),
        }
    }
}

impl BatchWriter for SendmmsgGsoPacketBatchWriter {
    fn empty(&self) -> bool {
        self.curr_size == 0
    }

    fn size(&self) -> usize {
        self.curr_size
    }

    fn reset(&mut self) {
        self.chains.clear();
        self.gso.clear();
        self.curr_bufs = 0;
        self.curr_size = 0;
        self.prev_size = 0;
    }

    fn append(&mut self, buf: Bytes, size: usize) -> bool {
        self.curr_size += size;

        // A larger packet starts a new run.
        if size > self.prev_size {
            self.chains.push(vec![buf]);
            // Zero until a second segment joins this run.
            self.gso.push(0);
            self.prev_size = size;
            self.curr_bufs += 1;
            return self.curr_bufs == self.max_bufs;
        }

        *self.gso.last_mut().expect("runs exist") = self.prev_size;
        self.chains.last_mut().expect("runs exist").push(buf);
        self.curr_bufs += 1;
        if self.curr_bufs == self.max_bufs {
            return true;
        }
        // A shorter segment ends the run; the next packet starts a new one.
        if size < self.prev_size {
            self.prev_size = 0;
        }
        false
    }

    fn flush(&mut self, socket: &dyn QuicUdpSocket, addr: SocketAddr) -> io::Result<usize> {
        let result = if self.chains.is_empty() {
            Ok(0)
        } else if self.chains.len() == 1 {
            if self.chains[0].len() > 1 {
                socket.write_gso(addr, &self.chains[0], self.gso[0])
            } else {
                socket.write(addr, &self.chains[0][0])
            }
        } else {
            let sent = socket.writem_gso(addr, &self.chains, &self.gso)?;
            if sent == self.chains.len() {
                Ok(self.curr_size)
            } else {
                Ok(0)
            }
        };
        self.reset();
        result
    }
}

/// Picks the batch writer for the configured mode, downgrading GSO modes
/// when the socket lacks kernel support.
pub fn make_batch_writer(
    batching_mode: QuicBatchingMode,
    batch_size: u32,
    gso_supported: bool,
) -> Box<dyn BatchWriter> {
    match batching_mode {
        QuicBatchingMode::None => Box::new(SinglePacketBatchWriter::new()),
        QuicBatchingMode::Gso => {
            if gso_supported {
                Box::new(GsoPacketBatchWriter::new(batch_size as usize))
            } else {
                warn!("GSO batching requested without kernel support; sending one packet per call");
                Box::new(SinglePacketBatchWriter::new())
            }
        }
        QuicBatchingMode::Sendmmsg => Box::new(SendmmsgPacketBatchWriter::new(batch_size as usize)),
        QuicBatchingMode::SendmmsgGso => {
            if gso_supported {
                Box::new(SendmmsgGsoPacketBatchWriter::new(batch_size as usize))
            } else {
                warn!("GSO batching requested without kernel support; falling back to sendmmsg");
                Box::new(SendmmsgPacketBatchWriter::new(batch_size as usize))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
    }

    fn packet(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[derive(Debug, PartialEq, Eq)]
    enum SocketCall {
        Write { len: usize },
        WriteGso { segments: usize, segment_size: usize },
        Writem { bufs: usize },
        WritemGso { chains: usize, gso: Vec<usize> },
    }

    #[derive(Default)]
    struct MockSocket {
        calls: RefCell<Vec<SocketCall>>,
    }

    impl QuicUdpSocket for MockSocket {
        fn write(&self, _addr: SocketAddr, buf: &[u8]) -> io::Result<usize> {
            self.calls.borrow_mut().push(SocketCall::Write { len: buf.len() });
            Ok(buf.len())
        }

        fn write_gso(
            &self,
            _addr: SocketAddr,
            segments: &[Bytes],
            segment_size: usize,
        ) -> io::Result<usize> {
            self.calls.borrow_mut().push(SocketCall::WriteGso {
                segments: segments.len(),
                segment_size,
            });
            Ok(segments.iter().map(Bytes::len).sum())
        }

        fn writem(&self, _addr: SocketAddr, bufs: &[Bytes]) -> io::Result<usize> {
            self.calls.borrow_mut().push(SocketCall::Writem { bufs: bufs.len() });
            Ok(bufs.len())
        }

        fn writem_gso(
            &self,
            _addr: SocketAddr,
            chains: &[Vec<Bytes>],
            segment_sizes: &[usize],
        ) -> io::Result<usize> {
            self.calls.borrow_mut().push(SocketCall::WritemGso {
                chains: chains.len(),
                gso: segment_sizes.to_vec(),
            });
            Ok(chains.len())
        }
    }

    #[test]
    fn single_packet_writer_always_flushes() {
        let mut writer = SinglePacketBatchWriter::new();
        assert!(writer.empty());
        assert!(writer.append(packet(100), 100));
        assert_eq!(writer.size(), 100);
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert!(writer.empty());
        assert_eq!(
            socket.calls.into_inner(),
            vec![SocketCall::Write { len: 100 }]
        );
    }

    #[test]
    fn gso_writer_accumulates_equal_sizes() {
        let mut writer = GsoPacketBatchWriter::new(4);
        assert!(!writer.append(packet(1000), 1000));
        assert!(!writer.append(packet(1000), 1000));
        assert!(!writer.append(packet(1000), 1000));
        // Fourth equal packet reaches max_bufs.
        assert!(writer.append(packet(1000), 1000));
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert_eq!(
            socket.calls.into_inner(),
            vec![SocketCall::WriteGso {
                segments: 4,
                segment_size: 1000
            }]
        );
        assert!(writer.empty());
        assert_eq!(writer.size(), 0);
    }

    #[test]
    fn gso_writer_smaller_last_segment_ends_batch() {
        let mut writer = GsoPacketBatchWriter::new(4);
        assert!(!writer.append(packet(1000), 1000));
        // A shorter segment is allowed but terminates the run.
        assert!(writer.append(packet(600), 600));
        // A packet of the previous full size would now need a flush first.
        assert!(writer.needs_flush(1000));
    }

    #[test]
    fn gso_writer_larger_packet_needs_flush() {
        let mut writer = GsoPacketBatchWriter::new(4);
        writer.append(packet(500), 500);
        assert!(writer.needs_flush(501));
        assert!(!writer.needs_flush(500));
        assert!(!writer.needs_flush(499));
    }

    #[test]
    fn gso_writer_single_buffer_uses_plain_write() {
        let mut writer = GsoPacketBatchWriter::new(4);
        writer.append(packet(700), 700);
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert_eq!(
            socket.calls.into_inner(),
            vec![SocketCall::Write { len: 700 }]
        );
    }

    #[test]
    fn sendmmsg_writer_mixed_sizes() {
        let mut writer = SendmmsgPacketBatchWriter::new(3);
        assert!(!writer.append(packet(100), 100));
        assert!(!writer.append(packet(1200), 1200));
        assert!(writer.append(packet(50), 50));
        assert_eq!(writer.size(), 1350);
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert_eq!(socket.calls.into_inner(), vec![SocketCall::Writem { bufs: 3 }]);
        assert!(writer.empty());
    }

    #[test]
    fn sendmmsg_gso_writer_builds_runs() {
        let mut writer = SendmmsgGsoPacketBatchWriter::new(16);
        // Run one: two 1000-byte segments and a short tail.
        assert!(!writer.append(packet(1000), 1000));
        assert!(!writer.append(packet(1000), 1000));
        assert!(!writer.append(packet(400), 400));
        // Larger packet starts run two.
        assert!(!writer.append(packet(1200), 1200));
        assert!(!writer.append(packet(1200), 1200));
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert_eq!(
            socket.calls.into_inner(),
            vec![SocketCall::WritemGso {
                chains: 2,
                gso: vec![1000, 1200]
            }]
        );
    }

    #[test]
    fn sendmmsg_gso_writer_single_plain_packet() {
        let mut writer = SendmmsgGsoPacketBatchWriter::new(16);
        writer.append(packet(900), 900);
        let socket = MockSocket::default();
        writer.flush(&socket, addr()).unwrap();
        assert_eq!(
            socket.calls.into_inner(),
            vec![SocketCall::Write { len: 900 }]
        );
    }

    #[test]
    fn sendmmsg_gso_writer_max_bufs_flushes() {
        let mut writer = SendmmsgGsoPacketBatchWriter::new(2);
        assert!(!writer.append(packet(1000), 1000));
        assert!(writer.append(packet(1000), 1000));
    }

    #[test]
    fn reset_clears_all_writers() {
        let writers: Vec<Box<dyn BatchWriter>> = vec![
            Box::new(SinglePacketBatchWriter::new()),
            Box::new(GsoPacketBatchWriter::new(4)),
            Box::new(SendmmsgPacketBatchWriter::new(4)),
            Box::new(SendmmsgGsoPacketBatchWriter::new(4)),
        ];
        for mut writer in writers {
            writer.append(packet(800), 800);
            writer.reset();
            assert!(writer.empty());
            assert_eq!(writer.size(), 0);
        }
    }

    #[test]
    fn factory_downgrades_without_gso() {
        // With GSO support the batch accepts multiple appends before a
        // flush; the downgraded writer flushes on the first one.
        let mut with_gso = make_batch_writer(QuicBatchingMode::Gso, 4, true);
        assert!(!with_gso.append(packet(1000), 1000));

        let mut without_gso = make_batch_writer(QuicBatchingMode::Gso, 4, false);
        assert!(without_gso.append(packet(1000), 1000));

        let mut fallback = make_batch_writer(QuicBatchingMode::SendmmsgGso, 4, false);
        assert!(!fallback.append(packet(1000), 1000));
        assert!(!fallback.append(packet(500), 500));
    }
}
