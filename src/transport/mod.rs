//! Transport seams.
//!
//! The core never speaks a telephony wire protocol. Inbound, a
//! [`WireDeserializer`] turns provider messages into frames; outbound, a
//! [`WireSerializer`] turns audio and interruption commands back into
//! provider messages sent through an [`AudioTransport`]. The paced
//! [`TransportOutput`] stage meters synthesized audio at real time.

mod input;
mod output;

pub use input::TransportInput;
pub use output::TransportOutput;

use crate::error::Result;
use crate::frames::{AudioData, Frame};
use async_trait::async_trait;

/// One message on the provider wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A text (usually JSON) message.
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
}

/// Translates outbound pipeline traffic into provider messages.
pub trait WireSerializer: Send + Sync {
    /// Serialize one audio chunk.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the chunk cannot be represented.
    fn serialize_audio(&self, audio: &AudioData) -> Result<Vec<WireMessage>>;

    /// The provider-specific command(s) that flush audio buffered on the
    /// far side after an interruption.
    fn serialize_interruption(&self) -> Vec<WireMessage>;
}

/// Translates inbound provider messages into frames.
pub trait WireDeserializer: Send + Sync {
    /// Deserialize one message; `None` for messages the pipeline does not
    /// care about (keep-alives, marks).
    fn deserialize(&self, message: WireMessage) -> Option<Frame>;
}

/// The outbound half of a provider connection.
#[async_trait]
pub trait AudioTransport: Send + Sync {
    /// Send one message to the provider.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection is broken.
    async fn send(&self, message: WireMessage) -> Result<()>;
}
