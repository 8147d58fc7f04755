use super::{Role, Tally, TransferStats};
use crate::channel::Channel;
use crate::error::TransferError;
use crate::protocol::{Chunk, Flags, Layout, ProtocolError};
use crate::transfer::FileWriter;
use crate::wait::Poller;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Attached but not yet visible to the sender.
    Announce,
    /// Waiting for a chunk we have not acknowledged yet.
    AwaitData,
    Consume,
    /// Chunk acknowledged, waiting for the sender to take the buffer back.
    AwaitReclaim,
    /// EOF consumed: drop `RECEIVER_READY`.
    Depart,
    Done,
}

/// Consuming half of the transfer.
pub struct Receiver<'a, C> {
    channel: &'a C,
    poller: &'a Poller,
    state: ReceiverState,
    area: Vec<u8>,
    tally: Tally,
}

impl<'a, C: Channel> Receiver<'a, C> {
    pub fn new(channel: &'a C, poller: &'a Poller) -> Result<Self, ProtocolError> {
        let layout = Layout::new(channel.size())?;
        Ok(Self {
            channel,
            poller,
            state: ReceiverState::Announce,
            area: vec![0; layout.payload_area()],
            tally: Tally::new(),
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Perform one transition. On error the state is left unchanged.
    pub async fn step<W, F>(
        &mut self,
        sink: &mut FileWriter<W>,
        on_chunk: &mut F,
    ) -> Result<ReceiverState, TransferError>
    where
        W: Write,
        F: FnMut(&Chunk),
    {
        let channel = self.channel;
        let next = match self.state {
            ReceiverState::Announce => {
                // Transfer bits are left alone: a sender that took a dead
                // receiver's RECEIVER_READY for ours may already have
                // published a chunk, and we pick it up from here.
                channel.raise(Flags::RECEIVER_READY);
                tracing::info!("announced to sender");
                ReceiverState::AwaitData
            }
            ReceiverState::AwaitData => {
                self.tally.polls += self
                    .poller
                    .until("a chunk", || {
                        let flags = channel.flags();
                        flags.contains(Flags::DATA_READY) && !flags.contains(Flags::DATA_READ)
                    })
                    .await?;
                ReceiverState::Consume
            }
            ReceiverState::Consume => {
                let eof = channel.flags().contains(Flags::EOF);
                channel.read_payload(&mut self.area);
                let chunk = Chunk::decode(&self.area, eof)?;
                sink.write_chunk(&chunk.data)?;

                tracing::trace!(index = self.tally.chunks, len = chunk.len(), eof, "chunk consumed");
                self.tally.record(&chunk);
                on_chunk(&chunk);
                channel.raise(Flags::DATA_READ);

                if eof {
                    ReceiverState::Depart
                } else {
                    ReceiverState::AwaitReclaim
                }
            }
            ReceiverState::AwaitReclaim => {
                // DATA_READY and DATA_READ drop together when the sender takes
                // the buffer back. DATA_READY may already be up again for the
                // next chunk by the time we look, DATA_READ will not.
                self.tally.polls += self
                    .poller
                    .until("the sender to reclaim the buffer", || {
                        !channel.flags().contains(Flags::DATA_READ)
                    })
                    .await?;
                ReceiverState::AwaitData
            }
            ReceiverState::Depart => {
                channel.lower(Flags::RECEIVER_READY);
                tracing::info!("departed");
                ReceiverState::Done
            }
            ReceiverState::Done => ReceiverState::Done,
        };

        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, "receiver transition");
        }
        self.state = next;
        Ok(next)
    }

    /// Drive the transfer until EOF has been consumed and announced.
    pub async fn run<W, F>(
        &mut self,
        sink: &mut FileWriter<W>,
        mut on_chunk: F,
    ) -> Result<TransferStats, TransferError>
    where
        W: Write,
        F: FnMut(&Chunk),
    {
        while self.state != ReceiverState::Done {
            self.step(sink, &mut on_chunk).await?;
        }
        Ok(self.tally.finish(Role::Receiver))
    }

    /// Withdraw `RECEIVER_READY` after a failed transfer.
    pub fn abandon(&self) {
        if self.state != ReceiverState::Announce {
            self.channel.lower(Flags::RECEIVER_READY);
        }
    }
}
