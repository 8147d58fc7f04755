//! The two halves of the flag handshake.
//!
//! Each role is an explicit state machine over a [`Channel`]:
//!
//! ```text
//! sender:   AwaitReceiver -> Produce -> AwaitConsumed -> Produce -> ... -> Finalize -> Done
//! receiver: Announce -> AwaitData -> Consume -> AwaitReclaim -> AwaitData -> ... -> Depart -> Done
//! ```
//!
//! The payload area belongs to the sender until it raises `DATA_READY`, and
//! to the receiver from then until it raises `DATA_READ`. Only a short chunk
//! carries `EOF`; a file that is an exact multiple of the chunk size ends
//! with an empty one.
//!
//! [`Channel`]: crate::channel::Channel

mod receiver;
mod sender;

pub use receiver::{Receiver, ReceiverState};
pub use sender::{Sender, SenderState};

use crate::protocol::Chunk;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Summary of one side of a finished transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub role: Role,
    pub bytes: u64,
    pub chunks: u64,
    /// Times a wait point found its condition false and slept.
    pub polls: u64,
    pub elapsed_secs: f64,
    /// BLAKE3 of the streamed bytes, hex encoded.
    pub digest: String,
}

struct Tally {
    started: Instant,
    hasher: blake3::Hasher,
    bytes: u64,
    chunks: u64,
    polls: u64,
}

impl Tally {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            hasher: blake3::Hasher::new(),
            bytes: 0,
            chunks: 0,
            polls: 0,
        }
    }

    fn record(&mut self, chunk: &Chunk) {
        self.hasher.update(&chunk.data);
        self.bytes += chunk.len() as u64;
        self.chunks += 1;
    }

    fn finish(&self, role: Role) -> TransferStats {
        TransferStats {
            role,
            bytes: self.bytes,
            chunks: self.chunks,
            polls: self.polls,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            digest: self.hasher.finalize().to_hex().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, MemoryChannel};
    use crate::error::TransferError;
    use crate::protocol::{Flags, Layout, PAYLOAD_OFFSET, TERMINATOR};
    use crate::transfer::{FileChunker, FileWriter};
    use crate::wait::{CancelToken, Poller, WaitError};
    use std::io::Cursor;
    use std::time::Duration;

    fn poller() -> Poller {
        Poller::new(Duration::from_millis(1)).with_timeout(Some(Duration::from_secs(10)))
    }

    fn impatient() -> Poller {
        Poller::new(Duration::from_millis(1)).with_timeout(Some(Duration::from_millis(30)))
    }

    /// Bytes that include zeros and terminator values in awkward places.
    fn pattern(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| match i % 5 {
                0 => 0,
                1 => TERMINATOR,
                _ => (i * 37 % 256) as u8,
            })
            .collect()
    }

    struct RoundTrip {
        output: Vec<u8>,
        sent: Vec<(usize, bool)>,
        received: Vec<(usize, bool)>,
        sender: TransferStats,
        receiver: TransferStats,
    }

    async fn round_trip(size: usize, data: &[u8]) -> RoundTrip {
        let channel = MemoryChannel::new(size);
        let poller = poller();
        let mut source = FileChunker::new(Cursor::new(data.to_vec()));
        let mut sink = FileWriter::new(Vec::new());
        let mut sent = Vec::new();
        let mut received = Vec::new();

        let mut sender = Sender::new(&channel, &poller).unwrap();
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let (sender_stats, receiver_stats) = tokio::join!(
            sender.run(&mut source, |c| sent.push((c.len(), c.eof))),
            receiver.run(&mut sink, |c| received.push((c.len(), c.eof)))
        );

        assert_eq!(sender.state(), SenderState::Done);
        assert_eq!(receiver.state(), ReceiverState::Done);
        assert!(!channel.flags().contains(Flags::RECEIVER_READY));

        RoundTrip {
            output: sink.into_inner().unwrap(),
            sent,
            received,
            sender: sender_stats.unwrap(),
            receiver: receiver_stats.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_is_byte_exact() {
        let layout = Layout::new(10).unwrap();
        for len in [0usize, 1, 7, 8, 9, 16, 17, 50] {
            let data = pattern(len);
            let result = round_trip(layout.size(), &data).await;

            assert_eq!(result.output, data, "len {len}");
            assert_eq!(result.sent, result.received, "len {len}");
            assert_eq!(result.sent.len() as u64, layout.chunk_count(len as u64), "len {len}");
            assert_eq!(result.sender.digest, result.receiver.digest);
            assert_eq!(result.receiver.bytes, len as u64);

            // Every chunk but the last is full; only the last carries EOF.
            let (last, body) = result.sent.split_last().unwrap();
            assert!(last.1);
            assert!(last.0 < layout.max_chunk());
            assert!(body.iter().all(|&(n, eof)| n == layout.max_chunk() && !eof));
        }
    }

    #[tokio::test]
    async fn test_empty_file_sends_single_eof_chunk() {
        let result = round_trip(10, &[]).await;
        assert_eq!(result.sent, vec![(0, true)]);
        assert!(result.output.is_empty());
        assert_eq!(result.receiver.chunks, 1);
    }

    #[tokio::test]
    async fn test_exact_payload_file_sends_trailing_empty_chunk() {
        let result = round_trip(10, &pattern(8)).await;
        assert_eq!(result.sent, vec![(8, false), (0, true)]);
        assert_eq!(result.output, pattern(8));
    }

    #[tokio::test]
    async fn test_default_region_size() {
        let data = pattern(1000);
        let result = round_trip(crate::protocol::DEFAULT_REGION_SIZE, &data).await;
        assert_eq!(result.output, data);
        assert_eq!(result.sent.len(), 1000 / 98 + 1);
    }

    #[tokio::test]
    async fn test_sender_waits_for_receiver_before_writing() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut source = FileChunker::new(Cursor::new(pattern(20)));
        let mut sender = Sender::new(&channel, &poller).unwrap();

        let err = sender.step(&mut source, &mut |_: &Chunk| {}).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Wait(WaitError::Timeout { waiting_for: "a receiver", .. })
        ));
        assert_eq!(sender.state(), SenderState::AwaitReceiver);
        assert_eq!(channel.snapshot(), vec![0; 10]);
        assert_eq!(source.bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_sender_clears_both_bits_when_reclaiming() {
        let channel = MemoryChannel::new(10);
        let poller = poller();
        let mut source = FileChunker::new(Cursor::new(pattern(20)));
        let mut sender = Sender::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        channel.raise(Flags::RECEIVER_READY);
        assert_eq!(sender.step(&mut source, &mut on_chunk).await.unwrap(), SenderState::Produce);
        assert_eq!(
            sender.step(&mut source, &mut on_chunk).await.unwrap(),
            SenderState::AwaitConsumed
        );
        assert_eq!(channel.flags(), Flags::RECEIVER_READY | Flags::DATA_READY);
        let mut expected = pattern(8);
        expected.push(TERMINATOR);
        assert_eq!(channel.snapshot()[PAYLOAD_OFFSET..], expected[..]);

        // Receiver acknowledges; the sender takes the buffer back.
        channel.raise(Flags::DATA_READ);
        assert_eq!(sender.step(&mut source, &mut on_chunk).await.unwrap(), SenderState::Produce);
        let flags = channel.flags();
        assert!(!flags.intersects(Flags::DATA_READY | Flags::DATA_READ));
        assert_eq!(flags, Flags::RECEIVER_READY);
    }

    #[tokio::test]
    async fn test_sender_keeps_channel_while_receiver_attached() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut source = FileChunker::new(Cursor::new(b"abc".to_vec()));
        let mut sender = Sender::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        channel.raise(Flags::RECEIVER_READY);
        sender.step(&mut source, &mut on_chunk).await.unwrap();
        assert_eq!(
            sender.step(&mut source, &mut on_chunk).await.unwrap(),
            SenderState::Finalize
        );
        assert!(channel.flags().contains(Flags::DATA_READY | Flags::EOF));

        assert!(sender.step(&mut source, &mut on_chunk).await.is_err());
        assert_eq!(sender.state(), SenderState::Finalize);

        channel.lower(Flags::RECEIVER_READY);
        assert_eq!(sender.step(&mut source, &mut on_chunk).await.unwrap(), SenderState::Done);
    }

    #[tokio::test]
    async fn test_dead_receiver_stalls_sender() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut source = FileChunker::new(Cursor::new(pattern(20)));
        let mut sender = Sender::new(&channel, &poller).unwrap();

        channel.raise(Flags::RECEIVER_READY);
        let err = sender.run(&mut source, |_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Wait(WaitError::Timeout {
                waiting_for: "the receiver to read a chunk",
                ..
            })
        ));
        assert_eq!(sender.state(), SenderState::AwaitConsumed);
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_sender() {
        let channel = MemoryChannel::new(10);
        let (handle, token) = CancelToken::pair();
        let poller = Poller::new(Duration::from_secs(3600)).with_cancel(token);
        let mut source = FileChunker::new(Cursor::new(pattern(3)));
        let mut sender = Sender::new(&channel, &poller).unwrap();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        };
        let (result, ()) = tokio::join!(sender.run(&mut source, |_| {}), cancel);
        assert!(matches!(
            result,
            Err(TransferError::Wait(WaitError::Cancelled { .. }))
        ));
    }

    #[tokio::test]
    async fn test_receiver_announces_without_touching_transfer_bits() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut sink = FileWriter::new(Vec::new());
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        assert_eq!(
            receiver.step(&mut sink, &mut on_chunk).await.unwrap(),
            ReceiverState::AwaitData
        );
        assert_eq!(channel.flags(), Flags::RECEIVER_READY);

        // Nothing published yet: the receiver must not consume.
        assert!(receiver.step(&mut sink, &mut on_chunk).await.is_err());
        assert_eq!(receiver.state(), ReceiverState::AwaitData);
        assert_eq!(sink.bytes_written(), 0);
    }

    #[tokio::test]
    async fn test_restarted_receiver_finishes_transfer_already_under_way() {
        let channel = MemoryChannel::new(10);
        let poller = poller();
        let data = pattern(20);
        let mut source = FileChunker::new(Cursor::new(data.clone()));
        let mut sender = Sender::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        // A receiver killed before it could lower RECEIVER_READY.
        channel.raise(Flags::RECEIVER_READY);
        sender.step(&mut source, &mut on_chunk).await.unwrap();
        assert_eq!(
            sender.step(&mut source, &mut on_chunk).await.unwrap(),
            SenderState::AwaitConsumed
        );
        assert_eq!(channel.flags(), Flags::RECEIVER_READY | Flags::DATA_READY);

        let mut sink = FileWriter::new(Vec::new());
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let (sent, received) = tokio::join!(
            sender.run(&mut source, |_| {}),
            receiver.run(&mut sink, |_| {})
        );
        let sent = sent.unwrap();
        let received = received.unwrap();

        assert_eq!(sink.into_inner().unwrap(), data);
        assert_eq!(sent.digest, received.digest);
        assert_eq!(sender.state(), SenderState::Done);
        assert!(!channel.flags().contains(Flags::RECEIVER_READY));
    }

    #[tokio::test]
    async fn test_receiver_ignores_chunk_it_already_acknowledged() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut sink = FileWriter::new(Vec::new());
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        receiver.step(&mut sink, &mut on_chunk).await.unwrap();
        channel.raise(Flags::DATA_READY | Flags::DATA_READ);
        assert!(receiver.step(&mut sink, &mut on_chunk).await.is_err());
        assert_eq!(receiver.state(), ReceiverState::AwaitData);
    }

    #[tokio::test]
    async fn test_receiver_departs_after_eof() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut sink = FileWriter::new(Vec::new());
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let mut lens = Vec::new();
        let mut on_chunk = |c: &Chunk| lens.push(c.len());

        receiver.step(&mut sink, &mut on_chunk).await.unwrap();

        let mut area = vec![0u8; 9];
        Chunk::new(b"hi".to_vec(), true).encode_into(&mut area).unwrap();
        channel.write_payload(&area);
        channel.raise(Flags::DATA_READY | Flags::EOF);

        assert_eq!(
            receiver.step(&mut sink, &mut on_chunk).await.unwrap(),
            ReceiverState::Consume
        );
        assert_eq!(
            receiver.step(&mut sink, &mut on_chunk).await.unwrap(),
            ReceiverState::Depart
        );
        assert!(channel.flags().contains(Flags::DATA_READ | Flags::RECEIVER_READY));
        assert_eq!(
            receiver.step(&mut sink, &mut on_chunk).await.unwrap(),
            ReceiverState::Done
        );
        assert!(!channel.flags().contains(Flags::RECEIVER_READY));
        assert_eq!(sink.into_inner().unwrap(), b"hi");
        assert_eq!(lens, vec![2]);
    }

    #[tokio::test]
    async fn test_receiver_rejects_corrupt_payload() {
        let channel = MemoryChannel::new(10);
        let poller = impatient();
        let mut sink = FileWriter::new(Vec::new());
        let mut receiver = Receiver::new(&channel, &poller).unwrap();
        let mut on_chunk = |_: &Chunk| {};

        receiver.step(&mut sink, &mut on_chunk).await.unwrap();
        channel.raise(Flags::DATA_READY);
        receiver.step(&mut sink, &mut on_chunk).await.unwrap();

        let err = receiver.step(&mut sink, &mut on_chunk).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        assert!(!channel.flags().contains(Flags::DATA_READ));

        receiver.abandon();
        assert!(!channel.flags().contains(Flags::RECEIVER_READY));
    }

    #[test]
    fn test_region_too_small_is_rejected() {
        let channel = MemoryChannel::new(2);
        let poller = poller();
        assert!(Sender::new(&channel, &poller).is_err());
        assert!(Receiver::new(&channel, &poller).is_err());
    }

    #[test]
    fn test_stats_serialize() {
        let mut tally = Tally::new();
        tally.record(&Chunk::new(b"abc".to_vec(), true));
        let json = serde_json::to_value(tally.finish(Role::Receiver)).unwrap();
        assert_eq!(json["role"], "receiver");
        assert_eq!(json["bytes"], 3);
        assert_eq!(json["digest"], blake3::hash(b"abc").to_hex().as_str());
    }
}
