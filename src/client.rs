//! Client root: owns the session, dispatcher, caches, and event bus.
//!
//! ARCHITECTURE
//! ============
//! `Client` wires the runtime together once: the caches fetch through the
//! endpoint packets, and the event bus carries a hook that applies inbound
//! events to the caches before any listener runs. Everything is passed
//! explicitly through `PacketContext`; nothing is process-global.
//!
//! Mutating operations follow one shape: issue the packet, then update the
//! cache. `set_topic` updates the cache optimistically; `kick` and `set_role`
//! update it after the service accepts the change.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheManager, EntityCache};
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, PacketHandle};
use crate::endpoints::PacketCatalog;
use crate::error::ClientError;
use crate::events::{Event, EventBus, EventKind, EventListener, ListenerResult};
use crate::model::{Conversation, Role, User};
use crate::packet::PacketContext;
use crate::request::{HttpTransport, ReqwestTransport};
use crate::session::{Authenticator, Session};

pub struct Client {
    context: PacketContext,
    catalog: Arc<PacketCatalog>,
    caches: CacheManager,
    events: EventBus,
}

impl Client {
    /// Build a client that talks HTTP through `reqwest`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built or an endpoint is missing.
    pub fn new(config: ClientConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self, ClientError> {
        let transport = ReqwestTransport::new(&config)?;
        Self::with_transport(config, authenticator, Arc::new(transport))
    }

    /// Build a client over any transport.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if an endpoint template is missing.
    pub fn with_transport(
        config: ClientConfig,
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ClientError> {
        let catalog = Arc::new(PacketCatalog::from_config(&config)?);
        let session = Session::new(authenticator, config.token_expiry_skew());
        let dispatcher = Dispatcher::new(config.dispatcher_workers);
        let context = PacketContext::new(transport, session, dispatcher, Arc::new(config));

        let conversations = {
            let ctx = context.clone();
            let catalog = Arc::clone(&catalog);
            EntityCache::new("conversations", move |id: String| {
                let packet = catalog.conversation(&id);
                let ctx = ctx.clone();
                async move { packet.execute(&ctx).await.map(Arc::new) }
            })
        };
        let users = {
            let ctx = context.clone();
            let catalog = Arc::clone(&catalog);
            EntityCache::new("users", move |username: String| {
                let packet = catalog.user_profile(&username);
                let ctx = ctx.clone();
                async move { packet.execute(&ctx).await.map(Arc::new) }
            })
        };
        let caches = CacheManager::new(conversations, users);

        let events = EventBus::new();
        events.set_cache_hook(CacheSync { caches: caches.clone() });

        info!(workers = context.config().dispatcher_workers, "client ready");
        Ok(Self { context, catalog, caches, events })
    }

    /// Authenticate now instead of on the first packet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] if the login fails.
    pub async fn login(&self) -> Result<(), ClientError> {
        self.session().refresh().await?;
        info!(identity = ?self.session().identity(), "logged in");
        Ok(())
    }

    #[must_use]
    pub fn context(&self) -> &PacketContext {
        &self.context
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        self.context.session()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.context.dispatcher()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.context.config()
    }

    #[must_use]
    pub fn catalog(&self) -> &PacketCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn caches(&self) -> &CacheManager {
        &self.caches
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// # Errors
    ///
    /// Returns [`ClientError::CacheFetchFailed`] if the conversation cannot be fetched.
    pub async fn conversation(&self, conversation_id: &str) -> Result<Arc<Conversation>, ClientError> {
        self.caches.conversations.get(conversation_id).await
    }

    /// # Errors
    ///
    /// Returns [`ClientError::CacheFetchFailed`] if the profile cannot be fetched.
    pub async fn user(&self, username: &str) -> Result<Arc<User>, ClientError> {
        self.caches.users.get(username).await
    }

    /// # Errors
    ///
    /// Propagates packet errors; `MalformedResponse` when no link is returned.
    pub async fn join_url(&self, conversation_id: &str) -> Result<String, ClientError> {
        self.catalog.join_url(conversation_id).execute(&self.context).await
    }

    /// # Errors
    ///
    /// Propagates packet errors; `MalformedResponse` when no thread id is returned.
    pub async fn guest_thread_id(&self, space_id: &str) -> Result<String, ClientError> {
        self.catalog.guest_thread_id(space_id).execute(&self.context).await
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Change a group topic. The cached conversation reflects the new topic
    /// immediately; the request runs on the dispatcher.
    pub fn set_topic(&self, conversation_id: &str, topic: &str) -> PacketHandle<()> {
        let cached = self.caches.conversations.peek(conversation_id);
        if cached.is_some_and(|c| !c.can_set_topic()) {
            return self.reject("set_topic", format!("{conversation_id} has no topic"));
        }

        modify_conversation(&self.caches.conversations, conversation_id, |c| {
            c.topic = topic.to_string();
        });
        self.catalog
            .set_topic(conversation_id, topic)
            .execute_async(&self.context)
    }

    /// Remove `username` from a group. The cache drops the member once the
    /// service confirms.
    pub fn kick(&self, conversation_id: &str, username: &str) -> PacketHandle<()> {
        let cached = self.caches.conversations.peek(conversation_id);
        if cached.is_some_and(|c| !c.can_kick()) {
            return self.reject("kick", format!("cannot kick from {conversation_id}"));
        }

        let packet = self.catalog.kick(conversation_id, username);
        let ctx = self.context.clone();
        let conversations = self.caches.conversations.clone();
        let (conversation_id, username) = (conversation_id.to_string(), username.to_string());
        self.dispatcher().submit("kick", async move {
            packet.execute(&ctx).await?;
            modify_conversation(&conversations, &conversation_id, |c| {
                c.remove_participant(&username);
            });
            Ok::<(), ClientError>(())
        })
    }

    /// Grant or revoke admin rights in a group.
    pub fn set_role(&self, conversation_id: &str, username: &str, role: Role) -> PacketHandle<()> {
        let packet = self.catalog.set_role(conversation_id, username, role);
        let ctx = self.context.clone();
        let conversations = self.caches.conversations.clone();
        let (conversation_id, username) = (conversation_id.to_string(), username.to_string());
        self.dispatcher().submit("set_role", async move {
            packet.execute(&ctx).await?;
            modify_conversation(&conversations, &conversation_id, |c| {
                c.set_role(&username, role);
            });
            Ok::<(), ClientError>(())
        })
    }

    /// Upload a new avatar for the logged-in user.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] when no identity is
    /// available, otherwise propagates packet errors.
    pub async fn set_profile_picture(&self, image: Vec<u8>) -> Result<Value, ClientError> {
        self.session().auth_headers().await?;
        let identity = self
            .session()
            .identity()
            .ok_or_else(|| ClientError::AuthenticationFailed("no identity after login".into()))?;
        self.catalog
            .set_profile_picture(&identity, image)
            .execute(&self.context)
            .await
    }

    /// Stop delivering events and drain the dispatcher.
    pub async fn shutdown(&self) {
        self.events.close();
        self.dispatcher().shutdown().await;
        info!("client shut down");
    }

    fn reject(&self, name: &str, reason: String) -> PacketHandle<()> {
        self.dispatcher()
            .submit(name.to_string(), async move { Err(ClientError::InvalidRequest(reason)) })
    }
}

fn modify_conversation(
    conversations: &EntityCache<String, Arc<Conversation>>,
    conversation_id: &str,
    f: impl FnOnce(&mut Conversation),
) -> bool {
    conversations
        .update_with(conversation_id, |c| {
            let mut next = (**c).clone();
            f(&mut next);
            Arc::new(next)
        })
        .is_some()
}

// =============================================================================
// CACHE HOOK
// =============================================================================

/// Applies inbound events to the caches. Installed as the bus's cache hook.
struct CacheSync {
    caches: CacheManager,
}

impl EventListener for CacheSync {
    fn on_event(&self, event: &Event) -> ListenerResult {
        let user = event.user.as_deref();
        let conversation = event.conversation.as_deref();

        match (&event.kind, conversation, user) {
            (EventKind::Typing | EventKind::MessageReceived, _, Some(user)) => {
                if self.caches.users.prefetch(user) {
                    debug!(event_id = %event.id, user, "warming profile of unknown sender");
                }
            }
            (EventKind::TopicChanged, Some(id), _) => {
                let topic = event.payload["topic"]
                    .as_str()
                    .ok_or("topic_changed event carries no topic")?
                    .to_string();
                modify_conversation(&self.caches.conversations, id, |c| c.topic = topic);
            }
            (EventKind::MemberJoined, Some(id), Some(user)) => {
                modify_conversation(&self.caches.conversations, id, |c| {
                    c.add_participant(user);
                });
            }
            (EventKind::MemberLeft, Some(id), Some(user)) => {
                modify_conversation(&self.caches.conversations, id, |c| {
                    c.remove_participant(user);
                });
            }
            (EventKind::RoleChanged, Some(id), Some(user)) => {
                let role = event.payload["role"]
                    .as_str()
                    .and_then(Role::parse)
                    .ok_or("role_changed event carries no valid role")?;
                modify_conversation(&self.caches.conversations, id, |c| {
                    c.set_role(user, role);
                });
            }
            _ => {
                debug!(event_id = %event.id, kind = ?event.kind, "event has no cache effect");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", self.session())
            .field("caches", &self.caches)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::request::{HttpRequest, HttpResponse};
    use crate::session::Credentials;

    /// Authenticator that counts calls and hands out `token-N` / `reg-N`.
    #[derive(Default)]
    pub struct CountingAuthenticator {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl CountingAuthenticator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            let auth = Self::default();
            auth.set_failing(true);
            auth
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self) -> Result<Credentials, ClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::AuthenticationFailed("login rejected".into()));
            }
            Ok(Credentials::new("alice", format!("reg-{n}"), format!("token-{n}")))
        }
    }

    type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, ClientError> + Send + Sync>;

    /// Transport that records every request and answers from a closure.
    pub struct FakeTransport {
        responder: Responder,
        requests: Mutex<Vec<HttpRequest>>,
        delay: Option<Duration>,
    }

    impl FakeTransport {
        pub fn new(responder: impl Fn(&HttpRequest) -> Result<HttpResponse, ClientError> + Send + Sync + 'static) -> Self {
            Self { responder: Box::new(responder), requests: Mutex::new(Vec::new()), delay: None }
        }

        pub fn ok(body: &str) -> Self {
            Self::status(200, body)
        }

        pub fn status(status: u16, body: &str) -> Self {
            let body = body.to_string();
            Self::new(move |_| Ok(HttpResponse::new(status, body.clone())))
        }

        /// Answers in order; the last response repeats.
        pub fn sequence(responses: Vec<HttpResponse>) -> Self {
            let queue = Mutex::new(VecDeque::from(responses));
            Self::new(move |_| {
                let mut queue = queue.lock().unwrap();
                let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
                next.ok_or_else(|| ClientError::Transport("no scripted response".into()))
            })
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn last_request(&self) -> Option<HttpRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.responder)(&request)
        }
    }

    /// Packet context over a fake transport with a counting authenticator.
    pub fn test_context(
        transport: &Arc<FakeTransport>,
        config: ClientConfig,
    ) -> (PacketContext, Arc<CountingAuthenticator>) {
        let auth = Arc::new(CountingAuthenticator::new());
        let authenticator: Arc<dyn Authenticator> = auth.clone();
        let session = Session::new(authenticator, config.token_expiry_skew());
        let dispatcher = Dispatcher::new(config.dispatcher_workers);
        let transport: Arc<dyn HttpTransport> = transport.clone();
        (PacketContext::new(transport, session, dispatcher, Arc::new(config)), auth)
    }

    pub fn test_client(transport: &Arc<FakeTransport>, config: ClientConfig) -> (Client, Arc<CountingAuthenticator>) {
        let auth = Arc::new(CountingAuthenticator::new());
        let authenticator: Arc<dyn Authenticator> = auth.clone();
        let transport: Arc<dyn HttpTransport> = transport.clone();
        let client = Client::with_transport(config, authenticator, transport).unwrap();
        (client, auth)
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Captures log output on the current thread while alive.
    pub struct LogCapture {
        buf: SharedBuf,
        _guard: tracing::subscriber::DefaultGuard,
    }

    impl LogCapture {
        pub fn install() -> Self {
            let buf = SharedBuf::default();
            let writer = buf.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .finish();
            let guard = tracing::subscriber::set_default(subscriber);
            Self { buf, _guard: guard }
        }

        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.buf.0.lock().unwrap()).into_owned()
        }

        pub fn count(&self, needle: &str) -> usize {
            self.contents().matches(needle).count()
        }
    }
}
