use tokio::sync::mpsc;

use crate::varint;

/// Reassembles logical packets from MTU-sized notification fragments.
///
/// Fragment 0 carries `varint(0) || varint(total_length) || version` and
/// starts a message; fragments must then arrive in sequence. Any gap drops
/// the partial message and the next fragment 0 starts afresh.
#[derive(Debug, Default)]
pub struct Assembler {
    protocol_version: u8,
    expected_length: usize,
    buffer: Vec<u8>,
    expected_fragment: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    /// Protocol version announced by the first fragment of the message
    /// currently being assembled.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Consume one notification fragment. Returns the completed logical
    /// packet once enough bytes have accumulated.
    pub fn feed(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (fragment_num, mut pos) = match varint::unpack(data, 0) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping fragment with malformed framing");
                self.reset();
                return None;
            }
        };

        if fragment_num == 0 {
            let (total_length, new_pos) = match varint::unpack(data, pos) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "Fragment 0 too short for total length");
                    self.reset();
                    return None;
                }
            };
            pos = new_pos;

            let version_byte = match data.get(pos) {
                Some(b) => *b,
                None => {
                    tracing::warn!("Fragment 0 too short for protocol version");
                    self.reset();
                    return None;
                }
            };
            pos += 1;

            self.protocol_version = version_byte >> 4;
            self.expected_length = total_length;
            self.buffer.clear();
            self.expected_fragment = 1;

            tracing::debug!(
                protocol_version = self.protocol_version,
                total_length = self.expected_length,
                "New message"
            );
        } else {
            if fragment_num != self.expected_fragment {
                tracing::warn!(
                    fragment_num,
                    expected = self.expected_fragment,
                    "Out-of-order fragment, dropping partial message"
                );
                self.reset();
                return None;
            }
            self.expected_fragment += 1;
        }

        self.buffer.extend_from_slice(&data[pos..]);

        tracing::trace!(
            fragment_num,
            buffered = self.buffer.len(),
            expected = self.expected_length,
            "Fragment accepted"
        );

        if self.buffer.len() >= self.expected_length {
            let message = self.buffer[..self.expected_length].to_vec();
            self.reset();
            return Some(message);
        }

        None
    }

    fn reset(&mut self) {
        self.protocol_version = 0;
        self.expected_length = 0;
        self.buffer.clear();
        self.expected_fragment = 0;
    }

    /// Drive the assembler over channels until the fragment source closes or
    /// the downstream consumer goes away. In-flight reassembly is discarded.
    pub async fn run(
        mut self,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        assembled: mpsc::Sender<Vec<u8>>,
    ) {
        while let Some(data) = incoming.recv().await {
            if let Some(message) = self.feed(&data) {
                if assembled.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_message() {
        let mut asm = Assembler::new();
        // fragment 0, total length 4, version 3 in the high nibble
        let out = asm.feed(&[0x00, 0x04, 0x30, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(out, Some(vec![0xAA, 0xBB, 0xCC, 0xDD]));
        assert_eq!(asm.protocol_version(), 0);
    }

    #[test]
    fn three_fragment_message() {
        // 53 payload bytes split 17/19/14, spread over three notifications.
        let payload: Vec<u8> = (0..53u8).collect();

        let mut frag0 = vec![0x00, 0x35, 0x30];
        frag0.extend_from_slice(&payload[..17]);
        let mut frag1 = vec![0x01];
        frag1.extend_from_slice(&payload[17..36]);
        let mut frag2 = vec![0x02];
        frag2.extend_from_slice(&payload[36..]);

        let mut asm = Assembler::new();
        assert_eq!(asm.feed(&frag0), None);
        assert_eq!(asm.protocol_version(), 3);
        assert_eq!(asm.feed(&frag1), None);
        assert_eq!(asm.feed(&frag2), Some(payload));

        // Reset: the next fragment 0 starts a fresh message.
        let out = asm.feed(&[0x00, 0x02, 0x30, 0x11, 0x22]);
        assert_eq!(out, Some(vec![0x11, 0x22]));
    }

    #[test]
    fn skipped_fragment_drops_partial_message() {
        let mut asm = Assembler::new();
        assert_eq!(asm.feed(&[0x00, 0x0A, 0x30, 0x01, 0x02]), None);
        assert_eq!(asm.feed(&[0x01, 0x03, 0x04]), None);
        // Fragment 3 skips 2: partial buffer is discarded.
        assert_eq!(asm.feed(&[0x03, 0x05, 0x06]), None);

        // A fresh message completes normally afterwards.
        let out = asm.feed(&[0x00, 0x03, 0x30, 0x07, 0x08, 0x09]);
        assert_eq!(out, Some(vec![0x07, 0x08, 0x09]));
    }

    #[test]
    fn stray_continuation_fragment_is_dropped() {
        let mut asm = Assembler::new();
        assert_eq!(asm.feed(&[0x02, 0xAA]), None);
        let out = asm.feed(&[0x00, 0x01, 0x30, 0x55]);
        assert_eq!(out, Some(vec![0x55]));
    }

    #[test]
    fn excess_bytes_are_truncated_to_expected_length() {
        let mut asm = Assembler::new();
        let out = asm.feed(&[0x00, 0x02, 0x30, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(out, Some(vec![0x01, 0x02]));
    }

    #[test]
    fn malformed_varint_resets_state() {
        let mut asm = Assembler::new();
        assert_eq!(asm.feed(&[0x00, 0x0A, 0x30, 0x01]), None);
        // Truncated continuation varint in place of a fragment number.
        assert_eq!(asm.feed(&[0x80]), None);
        let out = asm.feed(&[0x00, 0x01, 0x30, 0x42]);
        assert_eq!(out, Some(vec![0x42]));
    }

    #[tokio::test]
    async fn run_pumps_fragments_into_messages() {
        let (frag_tx, frag_rx) = mpsc::channel(16);
        let (msg_tx, mut msg_rx) = mpsc::channel(16);
        let driver = tokio::spawn(Assembler::new().run(frag_rx, msg_tx));

        frag_tx.send(vec![0x00, 0x04, 0x30, 0x01, 0x02]).await.unwrap();
        frag_tx.send(vec![0x01, 0x03, 0x04]).await.unwrap();

        assert_eq!(msg_rx.recv().await, Some(vec![0x01, 0x02, 0x03, 0x04]));

        // Closing the fragment source stops the driver.
        drop(frag_tx);
        driver.await.unwrap();
        assert_eq!(msg_rx.recv().await, None);
    }
}
