//! Session store collaborator.
//!
//! The tunnel treats persistence as an external ordered keyed store: sessions,
//! request header fragments, request body fragments, and response header
//! fragments, all scoped to one session id. Any backend qualifies as long as
//! it honors the trait contract; [`MemStore`] is the in-process reference
//! backend used by the binary and the tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use dynosaur::dynosaur;
use n0_error::{AnyError, anyerr, stack_error};
use rand::{Rng, distributions::Alphanumeric};

/// One session binding a capability token to its symmetric secret.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Opaque unguessable id, used as the capability token on every call.
    pub id: String,
    /// Per-session symmetric key material.
    pub secret: String,
    /// Lookups after this instant behave like lookups of a never-created id.
    pub expires_at: SystemTime,
}

/// Which side of the exchange a header fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Request,
    Response,
}

/// Failure of the store backend itself.
///
/// Fatal to the in-flight tunnel call; the egress agent never retries store
/// operations (the ingress agent's retry loop is the only retry point).
#[stack_error(add_meta, derive)]
pub struct StoreError {
    #[error(source)]
    source: AnyError,
}

/// Ordered keyed store for sessions and their fragments.
///
/// Implementations must scope every access strictly by session id: one
/// session's fragments are never visible through another session's id.
#[dynosaur(pub DynSessionStore = dyn(box) SessionStore)]
pub trait SessionStore: Send + Sync {
    /// Persists a new session with the given secret, minting a fresh
    /// unguessable id. The record expires `ttl` from now.
    fn create_session(
        &self,
        secret: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Looks up a session by id. Returns `None` for unknown ids and for
    /// records whose expiry has passed, indistinguishably.
    fn get_session<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send + 'a;

    /// Deletes the session and every fragment scoped to it.
    fn delete_session<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Inserts or replaces the header fragment named `name`. Values are raw
    /// bytes: header values are not required to be UTF-8.
    fn upsert_header<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
        name: &'a str,
        value: &'a [u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Lists header fragments of one kind. Order carries no meaning.
    fn list_headers<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
    ) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>, StoreError>> + Send + 'a;

    /// Inserts or replaces the body fragment at `index`.
    fn upsert_body_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u64,
        value: Bytes,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Lists body fragments ordered by index ascending.
    fn list_body_chunks<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Future<Output = Result<Vec<Bytes>, StoreError>> + Send + 'a;
}

impl<S: SessionStore> SessionStore for std::sync::Arc<S> {
    fn create_session(
        &self,
        secret: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<String, StoreError>> + Send {
        (**self).create_session(secret, ttl)
    }

    fn get_session<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send + 'a {
        (**self).get_session(id)
    }

    fn delete_session<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        (**self).delete_session(id)
    }

    fn upsert_header<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
        name: &'a str,
        value: &'a [u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        (**self).upsert_header(session_id, kind, name, value)
    }

    fn list_headers<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
    ) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>, StoreError>> + Send + 'a {
        (**self).list_headers(session_id, kind)
    }

    fn upsert_body_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u64,
        value: Bytes,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a {
        (**self).upsert_body_chunk(session_id, index, value)
    }

    fn list_body_chunks<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Future<Output = Result<Vec<Bytes>, StoreError>> + Send + 'a {
        (**self).list_body_chunks(session_id)
    }
}

/// Random alphanumeric token of `len` characters.
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug)]
struct SessionEntry {
    secret: String,
    expires_at: SystemTime,
    request_headers: Vec<(String, Vec<u8>)>,
    response_headers: Vec<(String, Vec<u8>)>,
    body_chunks: BTreeMap<u64, Bytes>,
}

/// In-memory [`SessionStore`] backend.
///
/// Fragments live inside their session's entry, so session-id scoping and
/// delete-together-with-session hold by construction.
#[derive(Debug, Default)]
pub struct MemStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Result<T, StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        match sessions.get_mut(session_id) {
            Some(entry) => Ok(f(entry)),
            None => Err(StoreError::new(anyerr!("unknown session {session_id}"))),
        }
    }
}

impl SessionStore for MemStore {
    async fn create_session(&self, secret: String, ttl: Duration) -> Result<String, StoreError> {
        let id = random_token(32);
        let entry = SessionEntry {
            secret,
            expires_at: SystemTime::now() + ttl,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            body_chunks: BTreeMap::new(),
        };
        self.sessions
            .lock()
            .expect("store lock poisoned")
            .insert(id.clone(), entry);
        Ok(id)
    }

    async fn get_session<'a>(&'a self, id: &'a str) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.lock().expect("store lock poisoned");
        Ok(sessions.get(id).and_then(|entry| {
            if entry.expires_at <= SystemTime::now() {
                None
            } else {
                Some(SessionRecord {
                    id: id.to_string(),
                    secret: entry.secret.clone(),
                    expires_at: entry.expires_at,
                })
            }
        }))
    }

    async fn delete_session<'a>(&'a self, id: &'a str) -> Result<(), StoreError> {
        self.sessions.lock().expect("store lock poisoned").remove(id);
        Ok(())
    }

    async fn upsert_header<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
        name: &'a str,
        value: &'a [u8],
    ) -> Result<(), StoreError> {
        self.with_entry(session_id, |entry| {
            let headers = match kind {
                HeaderKind::Request => &mut entry.request_headers,
                HeaderKind::Response => &mut entry.response_headers,
            };
            match headers.iter_mut().find(|(n, _)| n == name) {
                Some((_, v)) => *v = value.to_vec(),
                None => headers.push((name.to_string(), value.to_vec())),
            }
        })
    }

    async fn list_headers<'a>(
        &'a self,
        session_id: &'a str,
        kind: HeaderKind,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_entry(session_id, |entry| match kind {
            HeaderKind::Request => entry.request_headers.clone(),
            HeaderKind::Response => entry.response_headers.clone(),
        })
    }

    async fn upsert_body_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u64,
        value: Bytes,
    ) -> Result<(), StoreError> {
        self.with_entry(session_id, |entry| {
            entry.body_chunks.insert(index, value);
        })
    }

    async fn list_body_chunks<'a>(&'a self, session_id: &'a str) -> Result<Vec<Bytes>, StoreError> {
        self.with_entry(session_id, |entry| {
            entry.body_chunks.values().cloned().collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_come_back_in_index_order() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::from_secs(60))
            .await
            .unwrap();
        for index in [2u64, 0, 1] {
            store
                .upsert_body_chunk(&id, index, Bytes::from(format!("chunk{index}")))
                .await
                .unwrap();
        }
        let chunks = store.list_body_chunks(&id).await.unwrap();
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"chunk0chunk1chunk2");
    }

    #[tokio::test]
    async fn chunk_upsert_replaces_not_duplicates() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .upsert_body_chunk(&id, 0, Bytes::from_static(b"first"))
            .await
            .unwrap();
        store
            .upsert_body_chunk(&id, 0, Bytes::from_static(b"second"))
            .await
            .unwrap();
        let chunks = store.list_body_chunks(&id).await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"second")]);
    }

    #[tokio::test]
    async fn fragments_are_scoped_per_session() {
        let store = MemStore::new();
        let a = store
            .create_session("a".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let b = store
            .create_session("b".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .upsert_header(&a, HeaderKind::Request, "x-test", b"1")
            .await
            .unwrap();
        store
            .upsert_body_chunk(&a, 0, Bytes::from_static(b"body"))
            .await
            .unwrap();
        assert!(store.list_headers(&b, HeaderKind::Request).await.unwrap().is_empty());
        assert!(store.list_body_chunks(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_session_looks_never_created() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.get_session(&id).await.unwrap().is_none());
        assert!(store.get_session("no-such-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_session_and_fragments() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .upsert_body_chunk(&id, 0, Bytes::from_static(b"body"))
            .await
            .unwrap();
        store.delete_session(&id).await.unwrap();
        assert!(store.get_session(&id).await.unwrap().is_none());
        assert!(store.list_body_chunks(&id).await.is_err());
    }

    #[tokio::test]
    async fn header_upsert_replaces_same_name() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .upsert_header(&id, HeaderKind::Request, "x-test", b"1")
            .await
            .unwrap();
        store
            .upsert_header(&id, HeaderKind::Request, "x-test", b"2")
            .await
            .unwrap();
        let headers = store.list_headers(&id, HeaderKind::Request).await.unwrap();
        assert_eq!(headers, vec![("x-test".to_string(), b"2".to_vec())]);
    }

    #[tokio::test]
    async fn header_values_are_not_required_to_be_utf8() {
        let store = MemStore::new();
        let id = store
            .create_session("s".into(), Duration::from_secs(60))
            .await
            .unwrap();
        // Latin-1 "été", legal obs-text in a header value.
        store
            .upsert_header(&id, HeaderKind::Response, "x-note", b"\xe9t\xe9")
            .await
            .unwrap();
        let headers = store.list_headers(&id, HeaderKind::Response).await.unwrap();
        assert_eq!(headers, vec![("x-note".to_string(), b"\xe9t\xe9".to_vec())]);
    }
}
