//! Minimal RFC 8555 server: one account, one order, one dns-01 challenge.
//!
//! Nonces are single use and every signed request after `newAccount` must
//! carry the account URL as `kid`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head, post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};

const TOKEN: &str = "dns-token-1";

#[derive(Default)]
struct ServerState {
    next_nonce: u64,
    live_nonces: HashSet<String>,
    nonce_requests: usize,
    accounts: usize,
    reject_next_nonce: bool,
    bad_nonces: usize,
    order_status: &'static str,
    failing_polls: u32,
    finalize_posts: usize,
}

pub struct AcmeServer {
    base: String,
    domain: String,
    chain_pem: String,
    state: Mutex<ServerState>,
}

type Shared = State<Arc<AcmeServer>>;

impl AcmeServer {
    pub async fn start(domain: &str) -> Arc<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let key = rcgen::KeyPair::generate().unwrap();
        let chain_pem = rcgen::CertificateParams::new(vec![domain.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap()
            .pem();
        let server = Arc::new(Self {
            base,
            domain: domain.to_string(),
            chain_pem,
            state: Mutex::new(ServerState {
                order_status: "pending",
                ..ServerState::default()
            }),
        });

        let app = Router::new()
            .route("/directory", get(directory))
            .route("/nonce", head(new_nonce))
            .route("/acct", post(new_account))
            .route("/order", post(new_order))
            .route("/order/1", post(order))
            .route("/order/1/finalize", post(finalize))
            .route("/authz/1", post(authorization))
            .route("/chall/1", post(challenge))
            .route("/cert/1", post(certificate))
            .with_state(server.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        server
    }

    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.base)
    }

    /// The next signed request is answered with `badNonce`.
    pub fn reject_next_nonce(&self) {
        self.state().reject_next_nonce = true;
    }

    /// Order polls answer 503 this many times once the order is processing.
    pub fn fail_polls_while_processing(&self, times: u32) {
        self.state().failing_polls = times;
    }

    pub fn nonce_requests(&self) -> usize {
        self.state().nonce_requests
    }

    pub fn accounts(&self) -> usize {
        self.state().accounts
    }

    pub fn bad_nonces(&self) -> usize {
        self.state().bad_nonces
    }

    pub fn finalize_posts(&self) -> usize {
        self.state().finalize_posts
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    fn account_url(&self) -> String {
        format!("{}/acct/1", self.base)
    }

    fn issue_nonce(&self) -> String {
        let mut state = self.state();
        state.next_nonce += 1;
        let nonce = format!("nonce-{}", state.next_nonce);
        state.live_nonces.insert(nonce.clone());
        nonce
    }

    fn headers(&self, location: Option<String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let nonce = HeaderValue::from_str(&self.issue_nonce()).unwrap();
        headers.insert("replay-nonce", nonce);
        if let Some(location) = location {
            headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
        }
        headers
    }

    fn reply(&self, status: StatusCode, location: Option<String>, body: Value) -> Response {
        (status, self.headers(location), axum::Json(body)).into_response()
    }

    fn problem(&self, status: StatusCode, kind: &str, detail: &str) -> Response {
        self.reply(
            status,
            None,
            json!({"type": format!("urn:ietf:params:acme:error:{kind}"), "detail": detail}),
        )
    }

    /// Checks nonce and signer of a flattened JWS.
    fn accept(&self, body: &[u8], by_account: bool) -> Result<(), Response> {
        let jws: Value = serde_json::from_slice(body)
            .map_err(|_| self.problem(StatusCode::BAD_REQUEST, "malformed", "body is not JSON"))?;
        let protected = jws["protected"]
            .as_str()
            .and_then(|raw| URL_SAFE_NO_PAD.decode(raw).ok())
            .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
            .ok_or_else(|| {
                self.problem(StatusCode::BAD_REQUEST, "malformed", "bad protected header")
            })?;

        let nonce = protected["nonce"].as_str().unwrap_or_default();
        let fresh = {
            let mut state = self.state();
            let live = state.live_nonces.remove(nonce);
            let forced = std::mem::take(&mut state.reject_next_nonce);
            if !live || forced {
                state.bad_nonces += 1;
            }
            live && !forced
        };
        if !fresh {
            return Err(self.problem(StatusCode::BAD_REQUEST, "badNonce", "stale nonce"));
        }

        let signer_ok = if by_account {
            protected["kid"].as_str() == Some(self.account_url().as_str())
                && protected.get("jwk").is_none()
        } else {
            protected["jwk"].is_object() && protected.get("kid").is_none()
        };
        if !signer_ok {
            return Err(self.problem(
                StatusCode::BAD_REQUEST,
                "accountDoesNotExist",
                "unexpected signer",
            ));
        }
        Ok(())
    }

    fn order_json(&self, status: &str) -> Value {
        let mut order = json!({
            "status": status,
            "identifiers": [{"type": "dns", "value": self.domain}],
            "authorizations": [format!("{}/authz/1", self.base)],
            "finalize": format!("{}/order/1/finalize", self.base),
        });
        if status == "valid" {
            order["certificate"] = json!(format!("{}/cert/1", self.base));
        }
        order
    }
}

async fn directory(State(server): Shared) -> Response {
    axum::Json(json!({
        "newNonce": format!("{}/nonce", server.base),
        "newAccount": format!("{}/acct", server.base),
        "newOrder": format!("{}/order", server.base),
    }))
    .into_response()
}

async fn new_nonce(State(server): Shared) -> Response {
    server.state().nonce_requests += 1;
    (StatusCode::OK, server.headers(None)).into_response()
}

async fn new_account(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, false) {
        return rejected;
    }
    server.state().accounts += 1;
    server.reply(
        StatusCode::CREATED,
        Some(server.account_url()),
        json!({"status": "valid"}),
    )
}

async fn new_order(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    server.state().order_status = "pending";
    server.reply(
        StatusCode::CREATED,
        Some(format!("{}/order/1", server.base)),
        server.order_json("pending"),
    )
}

async fn order(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    let status = {
        let mut state = server.state();
        if state.order_status == "processing" {
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                None
            } else {
                state.order_status = "valid";
                Some("valid")
            }
        } else {
            Some(state.order_status)
        }
    };
    match status {
        Some(status) => server.reply(StatusCode::OK, None, server.order_json(status)),
        None => server.problem(
            StatusCode::SERVICE_UNAVAILABLE,
            "serverInternal",
            "try again",
        ),
    }
}

async fn finalize(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    let ready = {
        let mut state = server.state();
        state.finalize_posts += 1;
        if state.order_status == "ready" {
            state.order_status = "processing";
            true
        } else {
            false
        }
    };
    if ready {
        server.reply(StatusCode::OK, None, server.order_json("processing"))
    } else {
        server.problem(
            StatusCode::FORBIDDEN,
            "orderNotReady",
            "order is not ready for finalization",
        )
    }
}

async fn authorization(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    let validated = server.state().order_status != "pending";
    let status = if validated { "valid" } else { "pending" };
    server.reply(
        StatusCode::OK,
        None,
        json!({
            "identifier": {"type": "dns", "value": server.domain},
            "status": status,
            "challenges": [{
                "type": "dns-01",
                "url": format!("{}/chall/1", server.base),
                "token": TOKEN,
                "status": status,
            }],
        }),
    )
}

async fn challenge(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    {
        let mut state = server.state();
        if state.order_status == "pending" {
            state.order_status = "ready";
        }
    }
    server.reply(
        StatusCode::OK,
        None,
        json!({"type": "dns-01", "status": "valid", "token": TOKEN}),
    )
}

async fn certificate(State(server): Shared, body: Bytes) -> Response {
    if let Err(rejected) = server.accept(&body, true) {
        return rejected;
    }
    let mut headers = server.headers(None);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pem-certificate-chain"),
    );
    (StatusCode::OK, headers, server.chain_pem.clone()).into_response()
}
