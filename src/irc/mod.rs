//! IRC-facing core: virtual client sessions, the connection pool, the
//! event-deduplication broker and the identifier assignment queues.

pub mod broker;
pub mod connection;
pub mod debounce;
pub mod dedup;
pub mod events;
pub mod ident;
pub mod ident_listener;
pub mod ipv6;
pub mod isupport;
pub mod nick;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod session;

pub use broker::IrcEventBroker;
pub use events::{EventSink, IrcAction, IrcEvent, IrcUser};
pub use ident::IdentGenerator;
pub use ipv6::Ipv6Generator;
pub use pool::ClientPool;
pub use server::IrcServer;
pub use session::{BridgedClient, ClientStatus};
