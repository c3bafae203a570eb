//! Seams to the host shell: HTTP, durable key-value storage and push.
//!
//! The core never performs I/O on its own; every side effect goes through
//! one of these traits so the mobile shells (and tests) can supply it.

pub mod http;
pub mod kv;
pub mod push;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    RequestKind, ValidatedUrl,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
pub use self::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, TypedKvStore};
pub use self::push::{ChannelName, PushError, PushEvent, PushResult, PushSubscriptions, PushTransport};
