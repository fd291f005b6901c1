//! fleet_radio - duplex voice link between a dispatch console and a remote
//! speech agent.

pub mod audio;
pub mod config;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod ui_bridge;
pub mod voice_link;

pub use config::{Config, WireFormat};
pub use error::{DecodeError, LinkError};
pub use net_link::{NetCommand, NetEvent, SessionHandle, SpeechEndpoint, WsEndpoint};
pub use session::{LinkEvent, LinkState, SessionManager, SessionStats};
pub use voice_link::VoiceLink;
