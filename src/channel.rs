//! Channel abstraction between a session and its transport.
//!
//! The session never touches WebSocket types: it owns a [`SessionChannel`]
//! fed by the host (or a test), and the host pumps the matching
//! [`ChannelRemote`] to the real transport. Outbound sends are
//! fire-and-forget onto an unbounded queue so admission decisions never
//! suspend on the network.

use tokio::sync::mpsc;

use crate::protocol::ServerFrame;

/// Inbound transport event as the session sees it. Channel closure is
/// signalled by `recv()` returning `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A text frame.
    Text(String),
    /// A binary frame. Sessions ignore these with a warning.
    Binary(Vec<u8>),
}

/// Outbound instruction for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Send this text frame.
    Frame(String),
    /// Close the connection with this code and reason.
    Close {
        /// Application close code (1000/1001/1002).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// The session's end of the channel.
#[derive(Debug)]
pub struct SessionChannel {
    events: mpsc::Receiver<ChannelEvent>,
    out: mpsc::UnboundedSender<ChannelOutput>,
}

/// The host's (or test's) end of the channel.
#[derive(Debug)]
pub struct ChannelRemote {
    events: mpsc::Sender<ChannelEvent>,
    out: mpsc::UnboundedReceiver<ChannelOutput>,
}

/// Create a connected channel pair. `capacity` bounds the inbound queue;
/// outbound is unbounded so sends never block the session.
pub fn pair(capacity: usize) -> (SessionChannel, ChannelRemote) {
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        SessionChannel {
            events: events_rx,
            out: out_tx,
        },
        ChannelRemote {
            events: events_tx,
            out: out_rx,
        },
    )
}

impl SessionChannel {
    /// Next inbound event; `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Queue a frame for the client. Fire-and-forget: a transport that has
    /// already gone away just drops the frame.
    pub fn send(&self, frame: &ServerFrame) {
        if self.out.send(ChannelOutput::Frame(frame.encode())).is_err() {
            log::debug!("outbound queue closed, dropping frame");
        }
    }

    /// Ask the transport to close the connection.
    pub fn close(&self, code: u16, reason: &str) {
        if self
            .out
            .send(ChannelOutput::Close {
                code,
                reason: reason.to_string(),
            })
            .is_err()
        {
            log::debug!("outbound queue closed, dropping close({code})");
        }
    }
}

impl ChannelRemote {
    /// Deliver a text frame to the session. `false` if the session is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.events
            .send(ChannelEvent::Text(text.into()))
            .await
            .is_ok()
    }

    /// Deliver a binary frame to the session. `false` if the session is gone.
    pub async fn send_binary(&self, data: Vec<u8>) -> bool {
        self.events.send(ChannelEvent::Binary(data)).await.is_ok()
    }

    /// Next outbound instruction from the session; `None` once the session
    /// has finished shutting down.
    pub async fn next_output(&mut self) -> Option<ChannelOutput> {
        self.out.recv().await
    }

    /// Signal transport closure to the session, keeping the outbound side
    /// open so the shutdown flush can still be observed.
    pub fn disconnect(&mut self) {
        // Replace the sender with one whose receiver is gone.
        let (dead_tx, _) = mpsc::channel(1);
        self.events = dead_tx;
    }
}
