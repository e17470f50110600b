//! A client for the tablet vendor's cloud service.
//!
//! The cloud uses a two-tier bearer token scheme:
//!
//! - A long-lived **device token**, obtained once by exchanging an
//!   operator-entered one-time code ([`AuthClient::register`]). It has no
//!   embedded expiry; its failure mode is observed rejection, which is
//!   surfaced verbatim and never auto-recovered.
//! - A short-lived (~3 h) **user token**, derived from the device token and
//!   attached as the `Authorization: Bearer` header on every document API
//!   call. [`AuthClient::ensure_valid_token`] proactively renews it inside a
//!   5 minute safety margin, with a single-flight discipline so concurrent
//!   callers produce exactly one renewal request.
//!
//! Both tokens are persisted in a single owner-readable bundle by
//! [`TokenStore`]; writes are atomic (temp + fsync + rename) so concurrent
//! readers only ever observe a complete bundle.
//!
//! [`RemoteClient`] layers the document operations on top: list the remote
//! tree (flattened to notebooks), download a notebook archive, and resolve a
//! notebook's folder path from its ancestor collections.

pub mod auth;
pub mod claims;
pub mod error;
pub mod models;
pub mod remote;
pub mod rest;
pub mod token_store;

pub use auth::{AuthClient, HttpContext};
pub use error::{Error, ErrorKind};
pub use models::{DocType, Document, TokenBundle};
pub use remote::RemoteClient;
pub use rest::{RestClient, UrlRewriter};
pub use token_store::TokenStore;
