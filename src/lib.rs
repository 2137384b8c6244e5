//! Two-hop obfuscating reverse-proxy tunnel.
//!
//! A public-facing [`IngressProxy`] ("Pollux") accepts arbitrary inbound HTTP
//! requests and never talks to the real target directly: it fragments each
//! request into headers, body chunks, and a method/url pair, enciphers every
//! fragment with a per-session stream cipher over a printable 64-symbol
//! alphabet, and hands the fragments to a decoupled [`EgressProxy`]
//! ("Castor") over a five-endpoint HTTP wire protocol. The egress agent
//! reconstructs the request from its session store, performs it, and streams
//! the response back through the same tunnel as obfuscated text.
//!
//! The cipher is payload obfuscation against naive inspection, not vetted
//! cryptography; see [`TunnelCipher`].

mod cipher;
mod codec;
mod egress;
mod ingress;
mod store;
mod util;
mod wire;


pub use {
    cipher::TunnelCipher,
    codec::{CodecError, decode, encode},
    egress::{
        DEFAULT_CHUNK_SIZE, EgressError, EgressProxy, ResponseMeta, SESSION_TTL, SessionHandshake,
    },
    ingress::{ExchangeError, IngressProxy},
    store::{
        DynSessionStore, HeaderKind, MemStore, SessionRecord, SessionStore, StoreError,
    },
    util::chunk_stream,
    wire::{
        ADD_BODY_PATH, ADD_HEADER_PATH, AckReply, CREATE_SESSION_PATH, EXECUTE_PATH, MetaPayload,
        MetaReply, RESPONSE_META_PATH, SESSION_TOKEN_HEADER, STATUS_PSEUDO_HEADER, SessionReply,
    },
};
