use bt1bridge_lib::protocol::{FUNCTION_READ, FUNCTION_WRITE};
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::timeout;

/// How long the notify stream must stay quiet before a reply whose length
/// cannot be read from its header counts as complete.
pub const NOTIFICATION_GAP: Duration = Duration::from_millis(300);

/// Length a reply announces in its header: `5 + byteCount` for a read,
/// 8 for a write echo. `None` while the header is incomplete or the
/// operation is unknown.
fn declared_len(buffer: &[u8]) -> Option<usize> {
    match *buffer.get(1)? {
        FUNCTION_READ => buffer.get(2).map(|count| 5 + usize::from(*count)),
        FUNCTION_WRITE => Some(8),
        _ => None,
    }
}

/// Collects notification chunks into reply frames.
///
/// The BT-1 may split a reply across several notifications depending on the
/// negotiated MTU, and may deliver the tail of one reply together with the
/// next. A frame ends at the length its header declares; bytes past that
/// stay buffered for the following frame. Replies without a readable length
/// end when no further chunk arrives within the gap, and the decoder rejects
/// anything that was cut short.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
    ended: bool,
}

impl FrameAssembler {
    /// Returns the next frame, or `None` once the stream has ended and
    /// nothing is buffered.
    pub async fn next_frame<S, E>(
        &mut self,
        stream: &mut S,
        gap: Duration,
    ) -> Result<Option<Vec<u8>>, E>
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    {
        loop {
            if let Some(frame_len) = declared_len(&self.pending) {
                if self.pending.len() >= frame_len {
                    let rest = self.pending.split_off(frame_len);
                    return Ok(Some(std::mem::replace(&mut self.pending, rest)));
                }
            }
            if self.ended {
                return Ok(Some(std::mem::take(&mut self.pending)).filter(|f| !f.is_empty()));
            }

            let next = if self.pending.is_empty() {
                stream.next().await
            } else {
                match timeout(gap, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Ok(Some(std::mem::take(&mut self.pending))),
                }
            };
            match next {
                Some(chunk) => self.pending.extend_from_slice(&chunk?),
                None => self.ended = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt1bridge_lib::protocol::{append_crc, build_write_request};
    use futures_util::stream;
    use tokio::sync::mpsc;

    fn channel_stream(
        rx: mpsc::UnboundedReceiver<Result<Vec<u8>, String>>,
    ) -> impl Stream<Item = Result<Vec<u8>, String>> + Unpin {
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    fn read_reply(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff, FUNCTION_READ, payload.len() as u8];
        frame.extend_from_slice(payload);
        append_crc(&mut frame);
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_within_gap_are_joined() {
        let reply = read_reply(&[0x00, 0x64]);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = channel_stream(rx);
        tx.send(Ok(reply[..3].to_vec())).unwrap();
        tx.send(Ok(reply[3..].to_vec())).unwrap();

        let mut assembler = FrameAssembler::default();
        let frame = assembler
            .next_frame(&mut notifications, NOTIFICATION_GAP)
            .await
            .unwrap();
        assert_eq!(frame, Some(reply));
    }

    #[tokio::test(start_paused = true)]
    async fn read_reply_and_write_echo_in_one_chunk_are_split() {
        let reply = read_reply(&[0u8; 68]);
        let echo = build_write_request(0xff, 0x010a, 1).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = channel_stream(rx);
        let mut chunk = reply.clone();
        chunk.extend_from_slice(&echo[..4]);
        tx.send(Ok(chunk)).unwrap();
        tx.send(Ok(echo[4..].to_vec())).unwrap();

        let mut assembler = FrameAssembler::default();
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            Some(reply)
        );
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            Some(echo)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_gap_ends_frame_without_length() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = channel_stream(rx);
        tx.send(Ok(vec![0xff, 0x09])).unwrap();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(Ok(vec![0xff])).unwrap();
        });

        let mut assembler = FrameAssembler::default();
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            Some(vec![0xff, 0x09])
        );
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            Some(vec![0xff])
        );
        sender.await.unwrap();
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_read_reply_ends_after_gap() {
        let reply = read_reply(&[0u8; 68]);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = channel_stream(rx);
        tx.send(Ok(reply[..20].to_vec())).unwrap();

        let mut assembler = FrameAssembler::default();
        assert_eq!(
            assembler.next_frame(&mut notifications, NOTIFICATION_GAP).await.unwrap(),
            Some(reply[..20].to_vec())
        );
        drop(tx);
    }

    #[tokio::test]
    async fn stream_error_is_returned() {
        let mut notifications = stream::iter(vec![Ok(vec![1]), Err("link lost".to_string())]);
        assert_eq!(
            FrameAssembler::default()
                .next_frame(&mut notifications, NOTIFICATION_GAP)
                .await,
            Err("link lost".to_string())
        );
    }
}
