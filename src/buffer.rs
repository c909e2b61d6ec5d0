//! Endpoint packet buffers

use core::cell::UnsafeCell;

use crate::endpoint::MAX_PACKET_SIZE;

/// Packet memory behind one buffer descriptor
///
/// The serial interface engine reads IN data from, and writes OUT data to,
/// this memory while it owns the descriptor. Firmware may only access it
/// while firmware owns the descriptor.
#[repr(align(4))]
pub struct PacketBuffer(UnsafeCell<[u8; MAX_PACKET_SIZE]>);

impl PacketBuffer {
    pub const fn new() -> Self {
        PacketBuffer(UnsafeCell::new([0; MAX_PACKET_SIZE]))
    }

    /// Copy `data` into the packet buffer
    ///
    /// Returns the number of bytes written, which is constrained by the
    /// buffer size.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive access to the buffer, which means owning
    /// (or having claimed) the associated descriptor.
    pub unsafe fn write(&self, data: &[u8]) -> usize {
        let size = MAX_PACKET_SIZE.min(data.len());
        data.iter()
            .take(size)
            .fold(self.0.get().cast::<u8>(), |dst, src| {
                dst.write_volatile(*src);
                dst.add(1)
            });
        size
    }

    /// Copy up to `len` bytes out of the packet buffer
    ///
    /// Returns the number of bytes read into `data`.
    ///
    /// # Safety
    ///
    /// See [`write`](PacketBuffer::write).
    pub unsafe fn read(&self, data: &mut [u8], len: usize) -> usize {
        let size = MAX_PACKET_SIZE.min(data.len()).min(len);
        data.iter_mut()
            .take(size)
            .fold(self.0.get().cast::<u8>().cast_const(), |src, dst| {
                *dst = src.read_volatile();
                src.add(1)
            });
        size
    }
}

#[cfg(test)]
mod test {
    use super::PacketBuffer;
    use crate::endpoint::MAX_PACKET_SIZE;

    #[test]
    fn write_then_read() {
        let buffer = PacketBuffer::new();
        assert_eq!(unsafe { buffer.write(&[1, 2, 3, 4]) }, 4);

        let mut data = [0; 8];
        assert_eq!(unsafe { buffer.read(&mut data, 3) }, 3);
        assert_eq!(data, [1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn constrained_by_packet_size() {
        let buffer = PacketBuffer::new();
        let big = [0xA5; MAX_PACKET_SIZE + 7];
        assert_eq!(unsafe { buffer.write(&big) }, MAX_PACKET_SIZE);

        let mut data = [0; MAX_PACKET_SIZE + 7];
        assert_eq!(
            unsafe { buffer.read(&mut data, usize::max_value()) },
            MAX_PACKET_SIZE
        );
        assert!(data[..MAX_PACKET_SIZE].iter().all(|b| *b == 0xA5));
        assert!(data[MAX_PACKET_SIZE..].iter().all(|b| *b == 0));
    }
}
