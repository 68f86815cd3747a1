//! Scripted in-memory port for protocol tests.

use crate::error::Result;
use crate::port::{DataBits, FlowControl, Line, Parity, Port, Queue, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// In-memory port that plays the device side of a conversation.
///
/// Bytes written by the protocol code are appended to `written` and handed
/// to the optional responder, whose return value is queued as input for the
/// next reads. Reading from an empty queue reports a timeout, matching the
/// deadline semantics of a real port.
pub(crate) struct MockPort {
    input: VecDeque<u8>,
    pub written: Vec<u8>,
    responder: Option<Responder>,
    pub dtr: bool,
    pub rts: bool,
    baud_rate: u32,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            written: Vec::new(),
            responder: None,
            dtr: false,
            rts: false,
            baud_rate: 9600,
        }
    }

    /// Queue bytes the "device" will send.
    pub fn queue_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }

    /// Install the device-side script: called once per write with the
    /// written bytes, returns the bytes to queue as the reply.
    pub fn respond_with(&mut self, responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.responder = Some(Box::new(responder));
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.input.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no scripted input",
            ));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                },
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(buf);
            self.input.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn configure(
        &mut self,
        baud_rate: u32,
        _data_bits: DataBits,
        _parity: Parity,
        _stop_bits: StopBits,
        _flow_control: FlowControl,
    ) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn flush_queue(&mut self, queue: Queue) -> Result<()> {
        if matches!(queue, Queue::Input | Queue::Both) {
            self.input.clear();
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts = level;
        Ok(())
    }

    fn read_line(&mut self, _line: Line) -> Result<bool> {
        Ok(false)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.input.len())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn sleep(&mut self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_when_empty() {
        let mut port = MockPort::new();
        let mut buf = [0u8; 4];
        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_responder_round_trip() {
        let mut port = MockPort::new();
        port.respond_with(|cmd| cmd.to_vec());
        port.write_all(&[0x01, 0x02]).unwrap();

        let mut buf = [0u8; 2];
        port.read_all_bytes(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02]);
        assert_eq!(port.written, vec![0x01, 0x02]);
    }
}
