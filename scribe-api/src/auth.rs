//! The two-tier authentication lifecycle.
//!
//! [`AuthClient::register`] exchanges an operator-entered one-time code for
//! the long-lived device token (once per install). Thereafter,
//! [`AuthClient::ensure_valid_token`] keeps a fresh short-lived user token
//! on disk and hands out [`HttpContext`] snapshots for API calls.
//!
//! Freshness is judged by the token's embedded expiry claim, not by
//! observing a 401: renewing inside a safety margin prevents tokens from
//! expiring mid-request. An unparseable user token is treated the same as
//! an expired one.

use std::{
    sync::RwLock,
    time::{Duration, SystemTime},
};

use reqwest::Url;
use tracing::{debug, info, instrument};

use crate::{
    claims::TokenClaims,
    error::Error,
    models::TokenBundle,
    rest::RestClient,
    token_store::TokenStore,
};

/// Renew the user token when its remaining lifetime drops below this.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Fixed per-install device descriptor presented at registration.
pub const DEVICE_DESC: &str = "desktop-linux";

const DEVICE_TOKEN_PATH: &str = "/token/json/2/device/new";
const USER_TOKEN_PATH: &str = "/token/json/2/user/new";

/// Snapshot of everything [`crate::RemoteClient`] needs to authenticate one
/// request. Re-read after every [`AuthClient::ensure_valid_token`] call;
/// never cached across calls.
#[derive(Clone, Debug)]
pub struct HttpContext {
    pub bearer: String,
}

pub struct AuthClient {
    store: TokenStore,
    rest: RestClient,
    auth_base: Url,
    /// Serializes the read-check-renew-persist critical section.
    //
    // A tokio async Mutex, intentionally: the critical section spans the
    // renewal HTTP call, and holding a blocking Mutex across an await point
    // would stall every task on the runtime.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Latest context handed out, for [`Self::http_context`] readers.
    ctx: RwLock<Option<HttpContext>>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    code: &'a str,
    device_desc: &'a str,
    device_id: String,
}

impl AuthClient {
    pub fn new(
        store: TokenStore,
        rest: RestClient,
        auth_base: Url,
    ) -> Self {
        Self {
            store,
            rest,
            auth_base,
            refresh_lock: tokio::sync::Mutex::new(()),
            ctx: RwLock::new(None),
        }
    }

    /// Exchange an 8-character one-time code for a device token and persist
    /// it. Must run before any other authenticated call.
    #[instrument(skip_all, name = "(auth-register)")]
    pub async fn register(&self, one_time_code: &str) -> Result<(), Error> {
        let code = one_time_code.trim();
        if code.len() != 8 || !code.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::InvalidInput(format!(
                "one-time code must be 8 alphanumeric characters, got {:?}",
                one_time_code
            )));
        }

        let request = RegisterRequest {
            code,
            device_desc: DEVICE_DESC,
            device_id: uuid::Uuid::new_v4().to_string(),
        };
        let url = self.endpoint(DEVICE_TOKEN_PATH);
        let resp = self
            .rest
            .send(self.rest.client().post(url).json(&request))
            .await?;
        let device_token = resp
            .text()
            .await
            .map_err(|e| Error::transport("reading device token", e))?;
        if device_token.trim().is_empty() {
            return Err(Error::Rejected(
                "registration returned an empty device token".into(),
            ));
        }

        self.store.save(&TokenBundle {
            device_token: device_token.trim().to_owned(),
            user_token: None,
        })?;
        info!("Device registered; credentials stored");
        Ok(())
    }

    /// Guarantee a user token valid for at least [`REFRESH_BUFFER`] from
    /// now, renewing (and persisting) if needed.
    ///
    /// Callable from any task. All callers racing through an expired window
    /// serialize on the refresh lock: the first renews, the rest find the
    /// fresh bundle on disk and return it, so exactly one renewal request
    /// is made.
    pub async fn ensure_valid_token(&self) -> Result<HttpContext, Error> {
        let _guard = self.refresh_lock.lock().await;

        // Always re-load through the store; never trust an in-memory copy.
        let bundle = self.store.load()?.ok_or_else(|| {
            Error::Auth("not registered; run `scribe auth` first".into())
        })?;

        let now = SystemTime::now();
        if let Some(user_token) = bundle.user_token.as_deref() {
            // Parse failure or a missing exp claim reads as "expired".
            let expiry = TokenClaims::parse_unverified(user_token)
                .ok()
                .and_then(|claims| claims.expiry());
            match expiry {
                Some(expiry) if !token_needs_refresh(now, expiry) =>
                    return Ok(self.publish_ctx(user_token)),
                Some(_) => debug!("User token inside refresh buffer"),
                None => debug!("User token unparseable; renewing"),
            }
        }

        let user_token = self.renew_user_token(&bundle.device_token).await?;
        self.store.save(&TokenBundle {
            device_token: bundle.device_token,
            user_token: Some(user_token.clone()),
        })?;
        info!("User token renewed");
        Ok(self.publish_ctx(&user_token))
    }

    /// Whether a device token is on disk. Does not prove the cloud still
    /// accepts it.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.store.load(), Ok(Some(b)) if !b.device_token.is_empty())
    }

    /// The most recently published context, if any call succeeded yet.
    pub fn http_context(&self) -> Option<HttpContext> {
        self.ctx.read().expect("ctx lock poisoned").clone()
    }

    /// Present the device token to the renewal endpoint.
    ///
    /// The device token is never predictively refreshed: it carries no
    /// expiry claim, and a persistent rejection here surfaces verbatim as
    /// [`Error::Auth`] rather than triggering re-registration.
    async fn renew_user_token(
        &self,
        device_token: &str,
    ) -> Result<String, Error> {
        let url = self.endpoint(USER_TOKEN_PATH);
        let resp = self
            .rest
            .send(self.rest.client().post(url).bearer_auth(device_token))
            .await?;
        let user_token = resp
            .text()
            .await
            .map_err(|e| Error::transport("reading user token", e))?;
        if user_token.trim().is_empty() {
            return Err(Error::Rejected(
                "renewal returned an empty user token".into(),
            ));
        }
        Ok(user_token.trim().to_owned())
    }

    fn publish_ctx(&self, user_token: &str) -> HttpContext {
        let ctx = HttpContext {
            bearer: user_token.to_owned(),
        };
        *self.ctx.write().expect("ctx lock poisoned") = Some(ctx.clone());
        ctx
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.auth_base.as_str().trim_end_matches('/'))
    }
}

/// `true` if the token is expired or expires within [`REFRESH_BUFFER`].
#[inline]
pub fn token_needs_refresh(now: SystemTime, expiry: SystemTime) -> bool {
    now + REFRESH_BUFFER >= expiry
}

#[cfg(test)]
mod test {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use axum::{extract::State, routing::post, Router};

    use super::*;
    use crate::claims;

    #[test]
    fn refresh_buffer_boundaries() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        // Expiring in 2 minutes: refresh.
        assert!(token_needs_refresh(now, now + Duration::from_secs(120)));
        // Expiring exactly at the buffer edge: refresh.
        assert!(token_needs_refresh(now, now + REFRESH_BUFFER));
        // Expiring in 3 hours: fresh.
        assert!(!token_needs_refresh(now, now + Duration::from_secs(3 * 3600)));
        // Already expired: refresh.
        assert!(token_needs_refresh(now, now - Duration::from_secs(1)));
    }

    struct MockCloud {
        refresh_calls: AtomicUsize,
        register_calls: AtomicUsize,
    }

    /// Serve the two token endpoints on an ephemeral port.
    async fn spawn_mock_cloud() -> (Arc<MockCloud>, SocketAddr) {
        let cloud = Arc::new(MockCloud {
            refresh_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
        });

        async fn device_new(State(cloud): State<Arc<MockCloud>>) -> String {
            cloud.register_calls.fetch_add(1, Ordering::SeqCst);
            claims::fake_token(r#"{"iss":"cloud"}"#)
        }
        async fn user_new(State(cloud): State<Arc<MockCloud>>) -> String {
            cloud.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let exp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 3 * 3600;
            claims::fake_token(&format!(r#"{{"exp":{exp},"sync-version":3}}"#))
        }

        let app = Router::new()
            .route("/token/json/2/device/new", post(device_new))
            .route("/token/json/2/user/new", post(user_new))
            .with_state(Arc::clone(&cloud));
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (cloud, addr)
    }

    fn auth_client(dir: &tempfile::TempDir, addr: SocketAddr) -> AuthClient {
        scribe_logger::init_for_testing();
        let store = TokenStore::new(dir.path().join("token.json"));
        let rest = RestClient::new("scribe-test", None);
        let base: Url = format!("http://{addr}").parse().unwrap();
        AuthClient::new(store, rest, base)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_register_then_ensure() {
        let (cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_client(&dir, addr);

        assert!(!auth.is_authenticated());
        auth.register("abcd1234").await.unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(cloud.register_calls.load(Ordering::SeqCst), 1);

        let ctx = auth.ensure_valid_token().await.unwrap();
        assert_eq!(cloud.refresh_calls.load(Ordering::SeqCst), 1);

        // The renewed token is persisted and satisfies the freshness bound.
        let bundle =
            TokenStore::new(dir.path().join("token.json")).load().unwrap();
        let user_token = bundle.unwrap().user_token.unwrap();
        assert_eq!(user_token, ctx.bearer);
        let expiry = TokenClaims::parse_unverified(&user_token)
            .unwrap()
            .expiry()
            .unwrap();
        let min_expiry = SystemTime::now()
            + Duration::from_secs(2 * 3600 + 55 * 60);
        assert!(expiry >= min_expiry);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_code_is_rejected_locally() {
        let (cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_client(&dir, addr);

        for bad in ["", "short", "waytoolongcode", "abc 1234"] {
            let err = auth.register(bad).await.unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
        }
        assert_eq!(cloud.register_calls.load(Ordering::SeqCst), 0);
    }

    /// Two concurrent callers inside the expiry window produce exactly one
    /// renewal request, and both observe the same refreshed token.
    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_race_single_flight() {
        let (cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(auth_client(&dir, addr));

        // Seed a bundle whose user token expires in 2 minutes.
        let exp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 120;
        let stale = claims::fake_token(&format!(r#"{{"exp":{exp}}}"#));
        TokenStore::new(dir.path().join("token.json"))
            .save(&TokenBundle {
                device_token: "device.jwt.sig".into(),
                user_token: Some(stale.clone()),
            })
            .unwrap();

        let (a, b) = tokio::join!(
            {
                let auth = Arc::clone(&auth);
                async move { auth.ensure_valid_token().await }
            },
            {
                let auth = Arc::clone(&auth);
                async move { auth.ensure_valid_token().await }
            },
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(cloud.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.bearer, b.bearer);
        assert_ne!(a.bearer, stale);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_token_is_not_renewed() {
        let (cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_client(&dir, addr);

        let exp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3 * 3600;
        let fresh = claims::fake_token(&format!(r#"{{"exp":{exp}}}"#));
        TokenStore::new(dir.path().join("token.json"))
            .save(&TokenBundle {
                device_token: "device.jwt.sig".into(),
                user_token: Some(fresh.clone()),
            })
            .unwrap();

        let ctx = auth.ensure_valid_token().await.unwrap();
        assert_eq!(ctx.bearer, fresh);
        assert_eq!(cloud.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unparseable_user_token_forces_renewal() {
        let (cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_client(&dir, addr);

        TokenStore::new(dir.path().join("token.json"))
            .save(&TokenBundle {
                device_token: "device.jwt.sig".into(),
                user_token: Some("not-a-jwt".into()),
            })
            .unwrap();

        auth.ensure_valid_token().await.unwrap();
        assert_eq!(cloud.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unregistered_ensure_is_an_auth_error() {
        let (_cloud, addr) = spawn_mock_cloud().await;
        let dir = tempfile::tempdir().unwrap();
        let auth = auth_client(&dir, addr);

        let err = auth.ensure_valid_token().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Auth);
    }
}
