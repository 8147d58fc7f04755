use crate::protocol::Flags;

/// The shared region as the protocol sees it: one flags byte followed by a
/// payload area of `size() - 1` bytes.
///
/// Flag updates are atomic read-modify-write operations on the flags byte,
/// since both peers write bits of the same byte. A payload write must be
/// complete before the `raise` that publishes it, and a payload read must
/// happen after the `flags` load that observed it.
pub trait Channel {
    /// Region size in bytes, flags byte included.
    fn size(&self) -> usize;

    fn flags(&self) -> Flags;

    /// Set `flags`, leaving other bits alone.
    fn raise(&self, flags: Flags);

    /// Clear `flags`, leaving other bits alone.
    fn lower(&self, flags: Flags);

    /// Copy `payload` to the start of the payload area.
    fn write_payload(&self, payload: &[u8]);

    /// Fill `buf` from the start of the payload area.
    fn read_payload(&self, buf: &mut [u8]);
}

#[cfg(test)]
pub use memory::MemoryChannel;
