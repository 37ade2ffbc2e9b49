//! Initial state of every channel: collects the NUL-terminated service name the guest writes
//! before any real traffic.

use thiserror::Error;

/// Longest connection string, terminator included.
pub const CONNECTOR_BUFFER_SIZE: usize = 128;

const PIPE_PREFIX: &str = "pipe:";
const QEMUD_PREFIX: &str = "qemud:";
const QEMUD_SERVICE: &str = "qemud";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection string does not start with \"pipe:\": {0:?}")]
    NotAPipe(String),
    #[error("connection string is not utf-8")]
    NotUtf8,
    #[error("no pipe service named {0:?}")]
    UnknownService(String),
    #[error("pipe service {0:?} refused the connection")]
    Refused(String),
}

/// What a connector did with one guest send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Feed {
    /// All bytes taken, still waiting for the terminator.
    Pending(usize),
    /// The buffer filled up without a terminator.
    Overflow,
    /// The terminator arrived after `consumed` bytes of this send.
    Complete(usize),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Connector {
    buffer: Vec<u8>,
}

impl Connector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Restores a connector from its saved bytes.
    pub(crate) fn from_saved(buffer: Vec<u8>) -> Option<Self> {
        (buffer.len() <= CONNECTOR_BUFFER_SIZE).then_some(Self { buffer })
    }

    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Appends guest bytes up to and including the first NUL. Bytes after it are left unconsumed.
    pub(crate) fn feed(&mut self, buffers: &[&[u8]]) -> Feed {
        let mut consumed = 0;
        for buf in buffers {
            for &byte in buf.iter() {
                if self.buffer.len() == CONNECTOR_BUFFER_SIZE {
                    return Feed::Overflow;
                }
                self.buffer.push(byte);
                consumed += 1;
                if byte == 0 {
                    return Feed::Complete(consumed);
                }
            }
        }
        if self.buffer.len() == CONNECTOR_BUFFER_SIZE {
            Feed::Overflow
        } else {
            Feed::Pending(consumed)
        }
    }

    /// The connection string, without its terminator.
    pub(crate) fn target(&self) -> Result<&str, ConnectError> {
        let end = self
            .buffer
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.buffer.len());
        std::str::from_utf8(&self.buffer[..end]).map_err(|_| ConnectError::NotUtf8)
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target<'a> {
    pub name: &'a str,
    pub args: Option<&'a str>,
}

/// Splits `pipe:<name>[:<args>]` into service name and arguments.
///
/// `qemud:<x>` names the service `qemud:<x>` when `is_registered` knows it, and otherwise the
/// generic `qemud` service with `<x>` (and anything after it) as arguments.
pub(crate) fn parse_target<'a>(
    text: &'a str,
    is_registered: impl Fn(&str) -> bool,
) -> Result<Target<'a>, ConnectError> {
    let Some(rest) = text.strip_prefix(PIPE_PREFIX) else {
        return Err(ConnectError::NotAPipe(text.to_owned()));
    };

    if let Some(qemud) = rest.strip_prefix(QEMUD_PREFIX) {
        let (sub, args) = match qemud.split_once(':') {
            Some((sub, args)) => (sub, Some(args)),
            None => (qemud, None),
        };
        let name = &rest[..QEMUD_PREFIX.len() + sub.len()];
        if is_registered(name) {
            return Ok(Target { name, args });
        }
        return Ok(Target {
            name: QEMUD_SERVICE,
            args: Some(qemud),
        });
    }

    Ok(match rest.split_once(':') {
        Some((name, args)) => Target {
            name,
            args: Some(args),
        },
        None => Target {
            name: rest,
            args: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none(_: &str) -> bool {
        false
    }

    #[test]
    fn feed_stops_at_the_terminator() {
        let mut c = Connector::new();
        assert_eq!(c.feed(&[b"pipe:", b"ze"]), Feed::Pending(7));
        assert_eq!(c.feed(&[b"ro\0junk"]), Feed::Complete(3));
        assert_eq!(c.target(), Ok("pipe:zero"));
    }

    #[test]
    fn feed_overflows_without_a_terminator() {
        let mut c = Connector::new();
        assert_eq!(c.feed(&[&[b'a'; 100]]), Feed::Pending(100));
        assert_eq!(c.feed(&[&[b'a'; 28]]), Feed::Overflow);

        let mut c = Connector::new();
        let mut long = vec![b'a'; 127];
        long.push(0);
        assert_eq!(c.feed(&[&long]), Feed::Complete(128));
    }

    #[test]
    fn parse_plain_names() {
        assert_eq!(
            parse_target("pipe:zero", none),
            Ok(Target {
                name: "zero",
                args: None
            })
        );
        assert_eq!(
            parse_target("pipe:opengles:a:b", none),
            Ok(Target {
                name: "opengles",
                args: Some("a:b")
            })
        );
        assert_eq!(
            parse_target("pipe:x:", none),
            Ok(Target {
                name: "x",
                args: Some("")
            })
        );
        assert!(matches!(
            parse_target("tcp:5000", none),
            Err(ConnectError::NotAPipe(_))
        ));
    }

    #[test]
    fn qemud_prefers_a_dedicated_service() {
        let adb = |name: &str| name == "qemud:adb";
        assert_eq!(
            parse_target("pipe:qemud:adb:5555", adb),
            Ok(Target {
                name: "qemud:adb",
                args: Some("5555")
            })
        );
        assert_eq!(
            parse_target("pipe:qemud:sensors:list", adb),
            Ok(Target {
                name: "qemud",
                args: Some("sensors:list")
            })
        );
        assert_eq!(
            parse_target("pipe:qemud:adb", adb),
            Ok(Target {
                name: "qemud:adb",
                args: None
            })
        );
    }

    #[test]
    fn saved_state_over_the_limit_is_rejected() {
        assert!(Connector::from_saved(vec![1; CONNECTOR_BUFFER_SIZE]).is_some());
        assert!(Connector::from_saved(vec![1; CONNECTOR_BUFFER_SIZE + 1]).is_none());
    }
}
