//! Ordered reply writer for one connection.
//!
//! Every request gets a [`ReplySlot`] at dispatch time. A single writer task
//! owns the socket's sending half and drains the slots strictly in the order
//! they were handed out, closing each with a DONE frame. Command tasks may
//! finish in any order; their replies still reach the peer in request order.

use anyhow::Result;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{Frame, FrameWriter};

struct Outgoing {
    frame: Frame,
    flushed: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    fn delivered(self) -> Frame {
        if let Some(tx) = self.flushed {
            let _ = tx.send(());
        }
        self.frame
    }
}

/// Where one command sends its replies. Dropping it ends the command.
pub struct ReplySlot {
    tx: mpsc::UnboundedSender<Outgoing>,
}

/// Receiving end of a detached slot.
pub struct SlotReceiver {
    rx: mpsc::UnboundedReceiver<Outgoing>,
}

impl SlotReceiver {
    /// Next reply. Receiving it counts as delivery.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await.map(Outgoing::delivered)
    }
}

impl ReplySlot {
    /// A slot not attached to any writer, for driving handlers directly.
    pub fn detached() -> (Self, SlotReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, SlotReceiver { rx })
    }

    pub fn reply(&self, payload: impl Into<Vec<u8>>) {
        self.send(Outgoing {
            frame: Frame::reply(payload),
            flushed: None,
        });
    }

    /// Queue a reply and learn when it has actually gone out. Earlier slots
    /// may hold it back for as long as their commands run.
    pub fn reply_flushed(&self, payload: impl Into<Vec<u8>>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Outgoing {
            frame: Frame::reply(payload),
            flushed: Some(tx),
        });
        rx
    }

    fn send(&self, out: Outgoing) {
        if self.tx.send(out).is_err() {
            debug!("reply dropped, connection writer is gone");
        }
    }
}

pub struct Outbox {
    slots: mpsc::UnboundedSender<SlotReceiver>,
}

impl Outbox {
    /// Start the writer task. It ends once the outbox is dropped and every
    /// queued slot has been drained, or on the first send failure.
    pub fn spawn<W>(mut writer: FrameWriter<W>) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (slots, mut queue) = mpsc::unbounded_channel::<SlotReceiver>();
        let task = tokio::spawn(async move {
            while let Some(mut slot) = queue.recv().await {
                while let Some(out) = slot.rx.recv().await {
                    writer.write_frame(&out.frame).await?;
                    out.delivered();
                }
                writer.write_frame(&Frame::done()).await?;
            }
            writer.shutdown().await;
            Ok(())
        });
        (Self { slots }, task)
    }

    /// Reserve the next position in the reply order.
    pub fn slot(&self) -> ReplySlot {
        let (slot, rx) = ReplySlot::detached();
        if self.slots.send(rx).is_err() {
            debug!("slot queued after connection writer stopped");
        }
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameKind, FrameReader};
    use std::time::Duration;

    #[tokio::test]
    async fn replies_follow_slot_order_not_completion_order() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbox, writer) = Outbox::spawn(FrameWriter::new(a));
        let mut reader = FrameReader::new(b);

        let slow = outbox.slot();
        let fast = outbox.slot();
        fast.reply("second");
        drop(fast);
        tokio::task::yield_now().await;
        slow.reply("first");
        slow.reply("first again");
        drop(slow);
        drop(outbox);

        let mut seen = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            seen.push(match frame.kind {
                FrameKind::Done => "DONE".to_string(),
                _ => frame.text(),
            });
        }
        assert_eq!(seen, vec!["first", "first again", "DONE", "second", "DONE"]);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_slot_still_closes_with_done() {
        let (a, b) = tokio::io::duplex(1024);
        let (outbox, writer) = Outbox::spawn(FrameWriter::new(a));
        let mut reader = FrameReader::new(b);

        drop(outbox.slot());
        drop(outbox);

        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::done()));
        assert_eq!(reader.read_frame().await.unwrap(), None);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_notice_waits_for_earlier_slots() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (outbox, _writer) = Outbox::spawn(FrameWriter::new(a));
        let mut reader = FrameReader::new(b);

        let busy = outbox.slot();
        let later = outbox.slot();
        let mut flushed = later.reply_flushed("ok");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(flushed.try_recv().is_err(), "held back behind the busy slot");

        busy.reply("busy done");
        drop(busy);
        tokio::time::timeout(Duration::from_secs(1), flushed)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap().text(), "busy done");
        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::done()));
        assert_eq!(reader.read_frame().await.unwrap().unwrap().text(), "ok");
    }
}
