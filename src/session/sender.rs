use super::{Role, Tally, TransferStats};
use crate::channel::Channel;
use crate::error::TransferError;
use crate::protocol::{Chunk, Flags, Layout, ProtocolError};
use crate::transfer::FileChunker;
use crate::wait::Poller;
use std::io::Read;

/// Where the sender is in the handoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Waiting for `RECEIVER_READY`. No data has been written yet.
    AwaitReceiver,
    /// Buffer is ours: read, write and publish the next chunk.
    Produce,
    /// Chunk published, waiting for `DATA_READ`.
    AwaitConsumed,
    /// EOF published, waiting for the receiver to drop `RECEIVER_READY`.
    Finalize,
    Done,
}

/// Producing half of the transfer.
pub struct Sender<'a, C> {
    channel: &'a C,
    poller: &'a Poller,
    layout: Layout,
    state: SenderState,
    area: Vec<u8>,
    tally: Tally,
}

impl<'a, C: Channel> Sender<'a, C> {
    pub fn new(channel: &'a C, poller: &'a Poller) -> Result<Self, ProtocolError> {
        let layout = Layout::new(channel.size())?;
        Ok(Self {
            channel,
            poller,
            layout,
            state: SenderState::AwaitReceiver,
            area: vec![0; layout.payload_area()],
            tally: Tally::new(),
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Perform one transition. On error the state is left unchanged.
    pub async fn step<R, F>(
        &mut self,
        source: &mut FileChunker<R>,
        on_chunk: &mut F,
    ) -> Result<SenderState, TransferError>
    where
        R: Read,
        F: FnMut(&Chunk),
    {
        let channel = self.channel;
        let next = match self.state {
            SenderState::AwaitReceiver => {
                let stale = channel.flags().intersection(Flags::TRANSFER);
                if !stale.is_empty() {
                    tracing::warn!(%stale, "clearing flags left by an earlier transfer");
                    channel.lower(Flags::TRANSFER);
                }
                self.tally.polls += self
                    .poller
                    .until("a receiver", || channel.flags().contains(Flags::RECEIVER_READY))
                    .await?;
                tracing::info!("receiver attached");
                SenderState::Produce
            }
            SenderState::Produce => {
                let max = self.layout.max_chunk();
                let data = source.read_chunk(max)?;
                let eof = data.len() < max;
                let chunk = Chunk::new(data, eof);
                chunk.encode_into(&mut self.area)?;

                channel.write_payload(&self.area);
                channel.lower(Flags::DATA_READ);
                let mut publish = Flags::DATA_READY;
                if eof {
                    publish |= Flags::EOF;
                }
                channel.raise(publish);

                tracing::trace!(index = self.tally.chunks, len = chunk.len(), eof, "chunk published");
                self.tally.record(&chunk);
                on_chunk(&chunk);

                if eof {
                    SenderState::Finalize
                } else {
                    SenderState::AwaitConsumed
                }
            }
            SenderState::AwaitConsumed => {
                self.tally.polls += self
                    .poller
                    .until("the receiver to read a chunk", || {
                        channel.flags().contains(Flags::DATA_READ)
                    })
                    .await?;
                channel.lower(Flags::DATA_READY | Flags::DATA_READ);
                SenderState::Produce
            }
            SenderState::Finalize => {
                self.tally.polls += self
                    .poller
                    .until("the receiver to detach", || {
                        !channel.flags().contains(Flags::RECEIVER_READY)
                    })
                    .await?;
                tracing::info!("receiver departed");
                SenderState::Done
            }
            SenderState::Done => SenderState::Done,
        };

        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, "sender transition");
        }
        self.state = next;
        Ok(next)
    }

    /// Drive the transfer until the receiver has departed.
    pub async fn run<R, F>(
        &mut self,
        source: &mut FileChunker<R>,
        mut on_chunk: F,
    ) -> Result<TransferStats, TransferError>
    where
        R: Read,
        F: FnMut(&Chunk),
    {
        while self.state != SenderState::Done {
            self.step(source, &mut on_chunk).await?;
        }
        Ok(self.tally.finish(Role::Sender))
    }
}
