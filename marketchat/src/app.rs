//! Line-oriented front end.
//!
//! [`Command::parse`] turns one input line into a [`Command`];
//! [`App::execute`] runs it against an in-process [`MemoryBackend`] and
//! returns the lines to print. Several users can be signed in at once so a
//! single terminal can play both sides of a conversation.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use marketchat_docstore::admin;
use marketchat_docstore::{DocClient, MemoryBackend};
use marketchat_proto::document::Fields;
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, MessageId, UserId};
use marketchat_proto::paths;
use marketchat_proto::record::{ConversationPointer, Message, SenderId, Timestamp, field};
use marketchat_proto::store::{DocumentStore, SetOptions};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::denorm::DenormWarning;
use crate::chat::{AuthUser, ChatError, ChatSession, FallbackInit, Participant};
use crate::config::ClientConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySignal, NetworkGate};

const HELP: &[&str] = &[
    "/login <user> [name]       sign in (or switch to) a user",
    "/logout                    sign out the current user",
    "/post <item> <title> [url] list an item for sale",
    "/unlist <item>             remove your listing and notify buyers",
    "/chat <user> <item>        open the conversation about <item>",
    "/send <text>               send a message (plain text works too)",
    "/list                      show your conversations",
    "/show                      show the open conversation",
    "/online /offline           simulate network changes",
    "/background /foreground    simulate app visibility changes",
    "/admin-delete <user>       delete a user and their chats",
    "/quit                      exit",
];

const LISTING_REMOVED_NOTICE: &str = "This listing has been removed by the seller.";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in as `user`, or switch to them if already signed in.
    Login {
        /// User id.
        user: String,
        /// Display name.
        name: String,
    },
    /// Sign out the current user.
    Logout,
    /// Create or replace a listing owned by the current user.
    Post {
        /// Listing id.
        item: String,
        /// Listing title.
        title: String,
        /// Optional image URL.
        image: Option<String>,
    },
    /// Delete a listing and post a notice to its conversations.
    Unlist {
        /// Listing id.
        item: String,
    },
    /// Open the conversation with `with` about `item`.
    Chat {
        /// Counterpart user id.
        with: String,
        /// Listing id.
        item: String,
    },
    /// Send text to the open conversation.
    Send(String),
    /// Print the chat list.
    List,
    /// Print the open conversation.
    Show,
    /// Report a connectivity change.
    Signal(ConnectivitySignal),
    /// Delete a user with admin privileges.
    AdminDelete {
        /// User id.
        user: String,
    },
    /// Print the command summary.
    Help,
    /// Exit.
    Quit,
}

/// Input that is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The line was blank.
    #[error("empty input")]
    Empty,

    /// The command name is not known.
    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    /// A required argument is missing.
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl Command {
    /// Parses one input line. Lines without a leading `/` are messages.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for blank lines, unknown commands and
    /// missing arguments.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, args) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(name, args)| (name, args.trim()));
        let mut words = args.split_whitespace();

        match name {
            "login" => {
                let user = words
                    .next()
                    .ok_or(CommandError::Usage("/login <user> [name]"))?;
                let name = words.collect::<Vec<_>>().join(" ");
                Ok(Self::Login {
                    user: user.to_string(),
                    name: if name.is_empty() { user.to_string() } else { name },
                })
            }
            "logout" => Ok(Self::Logout),
            "post" => {
                const USAGE: &str = "/post <item> <title> [image-url]";
                let item = words.next().ok_or(CommandError::Usage(USAGE))?;
                let mut title: Vec<&str> = words.collect();
                let image = title
                    .last()
                    .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
                    .map(ToString::to_string);
                if image.is_some() {
                    title.pop();
                }
                if title.is_empty() {
                    return Err(CommandError::Usage(USAGE));
                }
                Ok(Self::Post {
                    item: item.to_string(),
                    title: title.join(" "),
                    image,
                })
            }
            "unlist" => {
                let item = words.next().ok_or(CommandError::Usage("/unlist <item>"))?;
                Ok(Self::Unlist {
                    item: item.to_string(),
                })
            }
            "chat" => match (words.next(), words.next()) {
                (Some(with), Some(item)) => Ok(Self::Chat {
                    with: with.to_string(),
                    item: item.to_string(),
                }),
                _ => Err(CommandError::Usage("/chat <user> <item>")),
            },
            "send" if args.is_empty() => Err(CommandError::Usage("/send <text>")),
            "send" => Ok(Self::Send(args.to_string())),
            "list" => Ok(Self::List),
            "show" => Ok(Self::Show),
            "online" => Ok(Self::Signal(ConnectivitySignal::Online)),
            "offline" => Ok(Self::Signal(ConnectivitySignal::Offline)),
            "background" => Ok(Self::Signal(ConnectivitySignal::Background)),
            "foreground" => Ok(Self::Signal(ConnectivitySignal::Foreground)),
            "admin-delete" => {
                let user = words
                    .next()
                    .ok_or(CommandError::Usage("/admin-delete <user>"))?;
                Ok(Self::AdminDelete {
                    user: user.to_string(),
                })
            }
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// The conversation a user has open.
struct ActiveChat {
    id: ConversationId,
    counterpart: UserId,
    fallback: Option<FallbackInit>,
}

/// Everything owned by one signed-in user.
struct UserContext {
    client: Arc<DocClient>,
    session: ChatSession<DocClient>,
    warnings: mpsc::Receiver<DenormWarning>,
    signals: mpsc::Sender<ConnectivitySignal>,
    connectivity: watch::Receiver<Connectivity>,
    monitor: JoinHandle<()>,
    active: Option<ActiveChat>,
    last_shown: Option<MessageId>,
    last_unread: u32,
}

/// Front-end state.
pub struct App {
    backend: MemoryBackend,
    config: ClientConfig,
    users: HashMap<UserId, UserContext>,
    current: Option<UserId>,
    names: HashMap<UserId, String>,
    should_quit: bool,
}

impl App {
    /// Creates an app over `backend` with nobody signed in.
    #[must_use]
    pub fn new(backend: MemoryBackend, config: ClientConfig) -> Self {
        Self {
            backend,
            config,
            users: HashMap::new(),
            current: None,
            names: HashMap::new(),
            should_quit: false,
        }
    }

    /// Returns `true` once `/quit` has run.
    #[must_use]
    pub const fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Returns the user commands currently act as.
    #[must_use]
    pub const fn current_user(&self) -> Option<&UserId> {
        self.current.as_ref()
    }

    /// Returns the current user's chat session.
    #[must_use]
    pub fn session(&self) -> Option<&ChatSession<DocClient>> {
        self.current
            .as_ref()
            .and_then(|id| self.users.get(id))
            .map(|ctx| &ctx.session)
    }

    /// Runs `command` and returns the lines to print.
    pub async fn execute(&mut self, command: Command) -> Vec<String> {
        match command {
            Command::Login { user, name } => self.login(&user, name),
            Command::Logout => self.logout(),
            Command::Post { item, title, image } => self.post(&item, title, image).await,
            Command::Unlist { item } => self.unlist(&item).await,
            Command::Chat { with, item } => self.open_chat(&with, &item).await,
            Command::Send(text) => self.send(&text).await,
            Command::List => self.list(),
            Command::Show => self.show(),
            Command::Signal(signal) => self.signal(signal).await,
            Command::AdminDelete { user } => self.admin_delete(&user).await,
            Command::Help => HELP.iter().map(ToString::to_string).collect(),
            Command::Quit => {
                self.shutdown();
                self.should_quit = true;
                vec!["Bye.".to_string()]
            }
        }
    }

    /// Returns lines describing what changed since the last poll: new
    /// messages in the open conversation, unread totals, connectivity and
    /// preview-write warnings.
    pub fn poll_updates(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        let format = self.config.timestamp_format.clone();
        let names = &self.names;
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get_mut(id)) else {
            return out;
        };

        while let Ok(warning) = ctx.warnings.try_recv() {
            out.push(format!(
                "! {} for {} not updated, retrying later",
                warning.kind, warning.conversation_id
            ));
        }

        if ctx.connectivity.has_changed().unwrap_or(false) {
            let state = *ctx.connectivity.borrow_and_update();
            out.push(format!("Network: {state}"));
        }

        if let Some(active) = &ctx.active {
            let view = ctx.session.messages();
            if view.conversation_id.as_ref() == Some(&active.id) {
                let start = ctx
                    .last_shown
                    .as_ref()
                    .and_then(|id| view.messages.iter().position(|m| &m.id == id))
                    .map_or(0, |i| i + 1);
                let me = &ctx.session.user().id;
                for message in view.messages.iter().skip(start) {
                    out.push(format_message(message, me, names, &format));
                }
                if let Some(last) = view.messages.last() {
                    ctx.last_shown = Some(last.id.clone());
                }
            }
        }

        let unread = ctx.session.total_unread();
        if unread != ctx.last_unread {
            ctx.last_unread = unread;
            if unread > 0 {
                out.push(format!("Unread messages: {unread}"));
            }
        }
        out
    }

    /// Signs out every user.
    pub fn shutdown(&mut self) {
        for (_, ctx) in self.users.drain() {
            log_out(ctx);
        }
        self.current = None;
    }

    fn login(&mut self, user: &str, name: String) -> Vec<String> {
        let id = UserId::new(user);
        if self.users.contains_key(&id) {
            self.current = Some(id);
            return vec![format!("Switched to {}.", self.display_name(user))];
        }

        let client = Arc::new(self.backend.client(&id));
        let gate = NetworkGate::new();
        let monitor =
            ConnectivityMonitor::new(Arc::clone(&client), gate.clone(), self.config.settle_delay);
        let connectivity = monitor.watch();
        let (signals, signal_rx) = mpsc::channel(16);

        let (session, warnings) = match ChatSession::login(
            Arc::clone(&client),
            AuthUser::new(user, name.clone()),
            gate,
            self.config.session_config(),
        ) {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(user_id = %id, error = %e, "login failed");
                return vec![e.user_notice().to_string()];
            }
        };

        let ctx = UserContext {
            client,
            session,
            warnings,
            signals,
            connectivity,
            monitor: monitor.spawn(signal_rx),
            active: None,
            last_shown: None,
            last_unread: 0,
        };
        self.users.insert(id.clone(), ctx);
        self.names.insert(id.clone(), name.clone());
        self.current = Some(id);
        vec![format!("Signed in as {name} ({user}).")]
    }

    fn logout(&mut self) -> Vec<String> {
        let Some(id) = self.current.take() else {
            return not_signed_in();
        };
        if let Some(ctx) = self.users.remove(&id) {
            log_out(ctx);
        }
        self.current = self.users.keys().next().cloned();
        match &self.current {
            Some(next) => vec![format!("Signed out {id}. Now acting as {next}.")],
            None => vec![format!("Signed out {id}.")],
        }
    }

    async fn post(&mut self, item: &str, title: String, image: Option<String>) -> Vec<String> {
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get(id)) else {
            return not_signed_in();
        };
        if item.contains('/') {
            return vec!["Listing ids cannot contain '/'.".to_string()];
        }

        let mut fields = Fields::new()
            .with(field::OWNER_ID, ctx.session.user().id.as_str())
            .with(field::TITLE, title.clone());
        if let Some(image) = image {
            fields = fields.with(field::IMAGE_URL, image);
        }
        let path = paths::listing_doc(&ItemId::new(item));
        match ctx.client.set(&path, fields, SetOptions::overwrite()).await {
            Ok(()) => vec![format!("Listed {item}: {title}")],
            Err(e) if e.is_permission_denied() => {
                vec!["That listing belongs to someone else.".to_string()]
            }
            Err(e) => {
                tracing::warn!(item_id = item, error = %e, "posting listing failed");
                vec![ChatError::from(e).user_notice().to_string()]
            }
        }
    }

    async fn unlist(&mut self, item: &str) -> Vec<String> {
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get(id)) else {
            return not_signed_in();
        };
        let me = ctx.session.user().id.clone();
        let item_id = ItemId::new(item);
        let store = ctx.session.store();

        match store.listing(&item_id).await {
            Ok(Some(listing)) if listing.owner_id == me => {}
            Ok(Some(_)) => return vec!["You can only remove your own listings.".to_string()],
            Ok(None) => return vec![format!("No listing {item}.")],
            Err(e) => return vec![e.user_notice().to_string()],
        }
        if let Err(e) = ctx.client.delete(&paths::listing_doc(&item_id)).await {
            tracing::warn!(item_id = item, error = %e, "deleting listing failed");
            return vec![ChatError::from(e).user_notice().to_string()];
        }

        let conversations = store
            .conversations_about(&me, &item_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(item_id = item, error = %e, "listing conversations unavailable");
                Vec::new()
            });
        let mut notified = 0;
        for conversation in &conversations {
            match ctx
                .session
                .post_system_notice(&conversation.id, LISTING_REMOVED_NOTICE)
                .await
            {
                Ok(_) => notified += 1,
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation.id, error = %e, "notice failed");
                }
            }
        }
        vec![format!(
            "Removed listing {item}; notified {notified} conversation(s)."
        )]
    }

    async fn open_chat(&mut self, with: &str, item: &str) -> Vec<String> {
        let other = UserId::new(with);
        let other_name = self.display_name(with);
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get_mut(id)) else {
            return not_signed_in();
        };
        let item_id = ItemId::new(item);
        let id = match ctx.session.start_conversation(&other, &item_id) {
            Ok(id) => id,
            Err(e) => return vec![e.user_notice().to_string()],
        };

        let details = ctx.session.conversation_details(&id).await;
        let listing = ctx.session.store().listing(&item_id).await.unwrap_or_else(|e| {
            tracing::warn!(item_id = item, error = %e, "listing lookup failed");
            None
        });
        let title = match (&details, &listing) {
            (Some(details), _) => details.conversation.item.title.clone(),
            (None, Some(listing)) => listing.title.clone(),
            (None, None) => return vec![format!("No listing {item} to chat about.")],
        };

        if let Err(e) = ctx.session.open_conversation(&id).await {
            return vec![e.user_notice().to_string()];
        }
        ctx.active = Some(ActiveChat {
            id,
            counterpart: other.clone(),
            fallback: listing.map(|listing| FallbackInit {
                recipient: Participant::new(other, other_name.clone()),
                item: listing.snapshot(),
            }),
        });
        ctx.last_shown = None;

        let mut out = vec![format!("Chatting with {other_name} about {title}.")];
        if details.is_some_and(|d| !d.listing_exists) {
            out.push("(This listing is no longer available.)".to_string());
        }
        out
    }

    async fn send(&mut self, text: &str) -> Vec<String> {
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get_mut(id)) else {
            return not_signed_in();
        };
        let Some(active) = ctx.active.as_mut() else {
            return vec!["Open a conversation first with /chat <user> <item>.".to_string()];
        };

        match ctx
            .session
            .send_message(&active.id, text, active.fallback.as_ref())
            .await
        {
            Ok(sent) => {
                if sent.conversation_created {
                    active.fallback = None;
                }
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(conversation_id = %active.id, error = %e, "send failed");
                vec![e.user_notice().to_string()]
            }
        }
    }

    fn list(&self) -> Vec<String> {
        let Some(session) = self.session() else {
            return not_signed_in();
        };
        let view = session.chat_list();
        if view.conversations.is_empty() {
            return vec!["No conversations yet.".to_string()];
        }
        let mut out: Vec<String> = view
            .conversations
            .iter()
            .map(|pointer| self.format_pointer(pointer))
            .collect();
        out.push(format!("Unread: {}", view.total_unread));
        out
    }

    fn show(&mut self) -> Vec<String> {
        let format = self.config.timestamp_format.clone();
        let names = &self.names;
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get_mut(id)) else {
            return not_signed_in();
        };
        let Some(active) = &ctx.active else {
            return vec!["No conversation is open.".to_string()];
        };

        let view = ctx.session.messages();
        let name = names
            .get(&active.counterpart)
            .map_or_else(|| active.counterpart.to_string(), Clone::clone);
        let mut out = vec![format!("-- {name} ({}) --", active.id)];
        if view.messages.is_empty() {
            out.push("(no messages yet)".to_string());
        }
        let me = &ctx.session.user().id;
        out.extend(
            view.messages
                .iter()
                .map(|message| format_message(message, me, names, &format)),
        );
        ctx.last_shown = view.messages.last().map(|m| m.id.clone());
        out
    }

    async fn signal(&mut self, signal: ConnectivitySignal) -> Vec<String> {
        let Some(ctx) = self.current.as_ref().and_then(|id| self.users.get(id)) else {
            return not_signed_in();
        };
        if ctx.signals.send(signal).await.is_err() {
            tracing::warn!(?signal, "connectivity monitor has stopped");
            return vec!["Connectivity monitor is not running.".to_string()];
        }
        Vec::new()
    }

    async fn admin_delete(&mut self, user: &str) -> Vec<String> {
        let id = UserId::new(user);
        let admin_client = self.backend.admin_client();
        match admin::delete_user(&admin_client, &id).await {
            Ok(counts) => {
                if let Some(ctx) = self.users.remove(&id) {
                    log_out(ctx);
                }
                if self.current.as_ref() == Some(&id) {
                    self.current = self.users.keys().next().cloned();
                }
                vec![format!(
                    "Deleted {user}: {} listing(s), {} conversation(s), {} message(s), {} pointer(s).",
                    counts.listings, counts.conversations, counts.messages, counts.pointers
                )]
            }
            Err(e) => {
                tracing::warn!(user_id = user, error = %e, "admin delete failed");
                vec![format!("Could not delete {user}.")]
            }
        }
    }

    fn display_name(&self, user: &str) -> String {
        self.names
            .get(&UserId::new(user))
            .map_or_else(|| user.to_string(), Clone::clone)
    }

    fn format_pointer(&self, pointer: &ConversationPointer) -> String {
        let unread = if pointer.unread_count > 0 {
            format!("[{}]", pointer.unread_count)
        } else {
            "   ".to_string()
        };
        let name = if pointer.other_user_name.is_empty() {
            pointer.other_user_id.to_string()
        } else {
            pointer.other_user_name.clone()
        };
        let preview = if pointer.last_message.is_empty() {
            "(no messages)"
        } else {
            pointer.last_message.as_str()
        };
        format!(
            "{unread} {name} · {}: {preview} {}",
            pointer.item.title,
            format_time(pointer.last_message_time, &self.config.timestamp_format)
        )
    }
}

fn log_out(ctx: UserContext) {
    ctx.monitor.abort();
    ctx.session.logout();
}

fn not_signed_in() -> Vec<String> {
    vec!["Sign in first with /login <user> [name].".to_string()]
}

fn format_message(
    message: &Message,
    me: &UserId,
    names: &HashMap<UserId, String>,
    format: &str,
) -> String {
    let sender = match &message.sender {
        SenderId::System => "system".to_string(),
        SenderId::User(id) if id == me => "you".to_string(),
        SenderId::User(id) => names.get(id).map_or_else(|| id.to_string(), Clone::clone),
    };
    format!(
        "[{}] {sender}: {}",
        format_time(message.timestamp, format),
        message.text
    )
}

/// Formats a store timestamp in local time. Unresolved timestamps render
/// as blank; an invalid format string falls back to the raw value.
fn format_time(time: Timestamp, format: &str) -> String {
    if time.as_millis() == 0 {
        return String::new();
    }
    let Some(local) = i64::try_from(time.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|utc| utc.with_timezone(&chrono::Local))
    else {
        return time.to_string();
    };
    let mut out = String::new();
    if write!(out, "{}", local.format(format)).is_err() {
        return time.to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  is it still available?  "),
            Ok(Command::Send("is it still available?".to_string()))
        );
    }

    #[test]
    fn login_name_may_have_spaces_and_defaults_to_id() {
        assert_eq!(
            Command::parse("/login u1 Ann Lee"),
            Ok(Command::Login {
                user: "u1".to_string(),
                name: "Ann Lee".to_string()
            })
        );
        assert_eq!(
            Command::parse("/login u2"),
            Ok(Command::Login {
                user: "u2".to_string(),
                name: "u2".to_string()
            })
        );
    }

    #[test]
    fn post_takes_trailing_image_url() {
        assert_eq!(
            Command::parse("/post ITEM42 Red bike https://img/bike.png"),
            Ok(Command::Post {
                item: "ITEM42".to_string(),
                title: "Red bike".to_string(),
                image: Some("https://img/bike.png".to_string()),
            })
        );
        assert_eq!(
            Command::parse("/post ITEM42 https://img/bike.png"),
            Err(CommandError::Usage("/post <item> <title> [image-url]"))
        );
    }

    #[test]
    fn missing_arguments_and_unknown_commands() {
        assert!(matches!(
            Command::parse("/chat u2"),
            Err(CommandError::Usage(_))
        ));
        assert!(matches!(Command::parse("/send"), Err(CommandError::Usage(_))));
        assert_eq!(
            Command::parse("/dance"),
            Err(CommandError::Unknown("dance".to_string()))
        );
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
    }

    #[test]
    fn connectivity_commands() {
        assert_eq!(
            Command::parse("/offline"),
            Ok(Command::Signal(ConnectivitySignal::Offline))
        );
        assert_eq!(
            Command::parse("/foreground"),
            Ok(Command::Signal(ConnectivitySignal::Foreground))
        );
    }

    #[test]
    fn pending_timestamp_renders_blank() {
        assert_eq!(format_time(Timestamp::from_millis(0), "%H:%M"), "");
        assert!(!format_time(Timestamp::from_millis(1_700_000_000_000), "%Y").is_empty());
    }

    #[tokio::test]
    async fn commands_require_a_user() {
        let mut app = App::new(MemoryBackend::new(), ClientConfig::default());
        let out = app.execute(Command::List).await;
        assert!(out[0].contains("Sign in"));
    }

    #[tokio::test]
    async fn buyer_and_seller_exchange_messages() {
        let mut app = App::new(MemoryBackend::new(), ClientConfig::default());
        app.execute(Command::parse("/login seller Sam").unwrap()).await;
        let out = app.execute(Command::parse("/post bike Red bike").unwrap()).await;
        assert_eq!(out, vec!["Listed bike: Red bike".to_string()]);

        app.execute(Command::parse("/login buyer Bea").unwrap()).await;
        let out = app.execute(Command::parse("/chat seller bike").unwrap()).await;
        assert_eq!(out[0], "Chatting with Sam about Red bike.");
        assert!(app.execute(Command::parse("still for sale?").unwrap()).await.is_empty());

        let mut messages = app.session().unwrap().watch_messages();
        messages.wait_for(|v| v.messages.len() == 1).await.unwrap();
        let updates = app.poll_updates();
        assert!(updates.iter().any(|l| l.ends_with("you: still for sale?")));

        app.execute(Command::parse("/login seller").unwrap()).await;
        assert_eq!(app.current_user(), Some(&UserId::new("seller")));
        let mut list = app.session().unwrap().watch_chat_list();
        list.wait_for(|v| v.total_unread == 1).await.unwrap();
        let out = app.execute(Command::List).await;
        assert!(out[0].starts_with("[1] Bea · Red bike: still for sale?"));
        assert_eq!(out.last().map(String::as_str), Some("Unread: 1"));
    }

    #[tokio::test]
    async fn unlisting_notifies_conversations() {
        let mut app = App::new(MemoryBackend::new(), ClientConfig::default());
        app.execute(Command::parse("/login seller Sam").unwrap()).await;
        app.execute(Command::parse("/post lamp Desk lamp").unwrap()).await;
        app.execute(Command::parse("/login buyer Bea").unwrap()).await;
        app.execute(Command::parse("/chat seller lamp").unwrap()).await;
        app.execute(Command::parse("hello").unwrap()).await;

        // buyer cannot remove the seller's listing
        let out = app.execute(Command::parse("/unlist lamp").unwrap()).await;
        assert_eq!(out, vec!["You can only remove your own listings.".to_string()]);

        app.execute(Command::parse("/login seller").unwrap()).await;
        let out = app.execute(Command::parse("/unlist lamp").unwrap()).await;
        assert_eq!(out, vec!["Removed listing lamp; notified 1 conversation(s).".to_string()]);

        app.execute(Command::parse("/login buyer").unwrap()).await;
        let out = app.execute(Command::parse("/chat seller lamp").unwrap()).await;
        assert_eq!(out[0], "Chatting with Sam about Desk lamp.");
        assert_eq!(out[1], "(This listing is no longer available.)");
    }

    #[tokio::test]
    async fn chat_about_unknown_listing_is_refused() {
        let mut app = App::new(MemoryBackend::new(), ClientConfig::default());
        app.execute(Command::parse("/login buyer").unwrap()).await;
        let out = app.execute(Command::parse("/chat seller ghost").unwrap()).await;
        assert_eq!(out, vec!["No listing ghost to chat about.".to_string()]);
    }

    #[tokio::test]
    async fn admin_delete_signs_the_user_out() {
        let mut app = App::new(MemoryBackend::new(), ClientConfig::default());
        app.execute(Command::parse("/login seller").unwrap()).await;
        app.execute(Command::parse("/post bike Bike").unwrap()).await;
        let out = app.execute(Command::parse("/admin-delete seller").unwrap()).await;
        assert!(out[0].starts_with("Deleted seller: 1 listing(s)"));
        assert!(app.current_user().is_none());
    }
}
