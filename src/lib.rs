//! Client runtime for a messaging service's private web API.
//!
//! The runtime authenticates a `Session`, executes `Packet`s inline or on the
//! `Dispatcher`, and keeps conversations and users in `EntityCache`s that are
//! refreshed both by fetches and by events published on the `EventBus`.

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod model;
pub mod packet;
pub mod request;
pub mod session;

pub use cache::{CacheManager, CacheState, EntityCache};
pub use client::Client;
pub use config::ClientConfig;
pub use dispatcher::{Dispatcher, PacketHandle};
pub use endpoints::PacketCatalog;
pub use error::{ClientError, ErrorCode};
pub use events::{Event, EventBus, EventKind, EventListener, ListenerId, ListenerResult};
pub use model::{Conversation, ConversationKind, GroupInfo, Role, User};
pub use packet::{BodyEncoding, Packet, PacketContext, PacketSpec, UrlTemplate};
pub use request::{ContentType, HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, RequestBuilder};
pub use session::{Authenticator, Credentials, Session, SessionStatus, StaticAuthenticator};
