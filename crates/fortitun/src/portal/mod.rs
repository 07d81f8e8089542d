// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SSL-VPN portal client: authenticate against the Fortigate web portal
//! and promote the TLS connection to tunnel mode.
//!
//! The exchange runs over the same TLS socket the tunnel will use,
//! operated in blocking style on the control thread:
//!
//! 1. preflight `GET /` (or `/{realm}/`), following up to two redirects;
//! 2. `GET /remote/login?lang=en` to prime server state;
//! 3. `POST /remote/logincheck`, then follow the `ret` code state machine
//!    (denied / granted / token / next-token / challenge);
//! 4. `GET /remote/sslvpn-tunnel` with `Host: sslvpn`; after this the
//!    socket speaks framed PPP and no HTTP request is valid on it.
//!
//! If the firewall closes the keep-alive connection mid-exchange, the
//! carrier reconnects once and re-verifies the certificate fingerprint
//! captured on the initial connect; a mismatch abandons the session.
//!
//! A preflight or login-page redirect that leaves the firewall's origin
//! is the SAML sign-on case: it is surfaced as [`Error::SamlRedirect`]
//! with the identity provider URL instead of being followed on the
//! carrier. The web view itself is the caller's collaborator;
//! [`PortalClient::complete_saml`] installs the cookie it obtained.

pub mod http;
pub mod login;

use std::time::Duration;

use zeroize::Zeroizing;

use crate::config::TlsSettings;
use crate::error::{Error, Result};
use crate::net::endpoint::Endpoint;
use crate::net::tls::{ConfirmCert, TlsConnector, TlsSocket};
use http::{read_answer, write_request, Answer, Carrier, CookieJar, HttpError};
use login::{Form, LoginPrompts, RetParams};

// ============================================================================
// Constants
// ============================================================================

/// Per-request timeout on the portal exchange.
const PORTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// MFA round-trips before the login is declared stuck.
const LOGIN_STEP_LIMIT: usize = 8;

/// The session cookie the tunnel promotion requires.
const SESSION_COOKIE: &str = "SVPNCOOKIE";

// ============================================================================
// Carrier over the TLS socket
// ============================================================================

/// The portal's transport: the TLS socket plus what is needed to
/// re-establish it (connector, endpoint, pinned fingerprint).
struct PortalCarrier {
    connector: TlsConnector,
    endpoint: Endpoint,
    socket: TlsSocket,
    pinned: [u8; 32],
    timeout: Duration,
}

impl Carrier for PortalCarrier {
    fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        self.socket.send_all(data, timeout)
    }

    fn recv_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.socket.recv_some(buf, timeout)
    }

    fn reopen(&mut self) -> Result<()> {
        log::debug!("reconnecting the portal carrier");
        let socket = self.connector.connect(&self.endpoint, self.timeout)?;

        // The certificate must not rotate within one session.
        match socket.fingerprint() {
            Some(fingerprint) if fingerprint == self.pinned => {
                self.socket = socket;
                Ok(())
            }
            _ => {
                log::error!("peer certificate changed across reconnect");
                Err(Error::FingerprintMismatch)
            }
        }
    }
}

// ============================================================================
// Request plumbing
// ============================================================================

/// A failure that means "the keep-alive connection went away".
fn is_disconnect(error: &Error) -> bool {
    match error {
        Error::Http(HttpError::Truncated) => true,
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

fn try_exchange<C: Carrier + ?Sized>(
    carrier: &mut C,
    host: &str,
    cookies: &CookieJar,
    verb: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    timeout: Duration,
) -> Result<Answer> {
    let wire = Zeroizing::new(write_request(
        verb,
        path,
        host,
        cookies.header_value().as_deref(),
        extra_headers,
        body,
    ));
    carrier.send_all(&wire, timeout)?;
    read_answer(carrier, timeout)
}

/// One request/response, reconnecting once if the keep-alive connection
/// was dropped. Set-Cookie headers land in the jar.
#[allow(clippy::too_many_arguments)]
fn exchange<C: Carrier + ?Sized>(
    carrier: &mut C,
    host: &str,
    cookies: &mut CookieJar,
    verb: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    timeout: Duration,
) -> Result<Answer> {
    let answer = match try_exchange(carrier, host, cookies, verb, path, extra_headers, body, timeout)
    {
        Err(e) if is_disconnect(&e) => {
            log::debug!("portal connection dropped ({}), retrying once", e);
            carrier.reopen()?;
            try_exchange(carrier, host, cookies, verb, path, extra_headers, body, timeout)?
        }
        other => other?,
    };

    for set_cookie in answer.headers_named("set-cookie") {
        cookies.store(set_cookie);
    }
    Ok(answer)
}

fn require_status(answer: &Answer, accepted: &[u16]) -> Result<()> {
    if accepted.contains(&answer.status) {
        return Ok(());
    }
    Err(Error::Http(HttpError::Status(
        answer.status,
        answer.reason.clone(),
    )))
}

/// Where a `Location` header points, relative to the portal origin.
#[derive(Debug, PartialEq, Eq)]
enum RedirectTarget {
    /// Same origin; carries the request path to follow on the carrier.
    Portal(String),
    /// Different origin, which in practice means an external identity
    /// provider; carries the absolute URL for a web view.
    External(String),
}

/// Classify a redirect. A relative location or an absolute one naming
/// the firewall stays on the carrier; anything else is the SAML case and
/// must not be mangled into a same-origin path.
fn redirect_target(location: &str, our_host: &str) -> RedirectTarget {
    let Some((_, rest)) = location.split_once("://") else {
        return RedirectTarget::Portal(location.to_string());
    };

    let (loc_host, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], rest[slash..].to_string()),
        None => (rest, "/".to_string()),
    };

    if same_origin(loc_host, our_host) {
        RedirectTarget::Portal(path)
    } else {
        RedirectTarget::External(location.to_string())
    }
}

/// Host comparison for redirects. `our_host` always carries a port; a
/// location without one still counts as the same firewall.
fn same_origin(loc_host: &str, our_host: &str) -> bool {
    let (our_name, our_port) = our_host.rsplit_once(':').unwrap_or((our_host, ""));
    match loc_host.rsplit_once(':') {
        Some((name, port)) => name.eq_ignore_ascii_case(our_name) && port == our_port,
        None => loc_host.eq_ignore_ascii_case(our_name),
    }
}

// ============================================================================
// Login state machine
// ============================================================================

fn logincheck<C: Carrier + ?Sized>(
    carrier: &mut C,
    host: &str,
    cookies: &mut CookieJar,
    form: &Form,
    timeout: Duration,
) -> Result<Answer> {
    let body = form.body();
    exchange(
        carrier,
        host,
        cookies,
        "POST",
        "/remote/logincheck",
        &[
            ("Content-Type", "text/plain;charset=UTF-8"),
            ("Pragma", "no-cache"),
        ],
        body.expose(),
        timeout,
    )
}

/// Drive the `ret`-code state machine to an authenticated session.
///
/// | `ret` | step |
/// |-------|------|
/// | 0 | denied; error text in the `redir` query |
/// | 1 | follow `redir`, expect the session cookie |
/// | 2/3/4 | token prompt, re-POST with `code` + echoed fields |
/// | 5 | token drifted, re-POST with `code2` |
/// | 6 | challenge, re-POST with `credential2` + composite ids |
pub(crate) fn login_flow<C: Carrier + ?Sized>(
    carrier: &mut C,
    host: &str,
    realm: Option<&str>,
    cookies: &mut CookieJar,
    prompts: &mut dyn LoginPrompts,
    timeout: Duration,
) -> Result<()> {
    // Start unauthenticated.
    cookies.clear();

    // Prime the login page; a language redirect is followed once.
    let mut answer = exchange(
        carrier,
        host,
        cookies,
        "GET",
        "/remote/login?lang=en",
        &[],
        b"",
        timeout,
    )?;
    if answer.status == 302 {
        let location = answer
            .header("location")
            .ok_or(Error::Http(HttpError::Malformed("redirect without location")))?;
        let path = match redirect_target(location, host) {
            RedirectTarget::Portal(path) => path,
            RedirectTarget::External(url) => return Err(Error::SamlRedirect(url)),
        };
        answer = exchange(carrier, host, cookies, "GET", &path, &[], b"", timeout)?;
    }
    require_status(&answer, &[200])?;

    let credentials = prompts.ask_credentials().ok_or(Error::LoginCancelled)?;

    let mut form = Form::new();
    form.set("ajax", "1");
    form.set("username", &http::url_encode(&credentials.username));
    {
        let password = Zeroizing::new(
            String::from_utf8_lossy(credentials.password.expose()).into_owned(),
        );
        form.set("credential", &http::url_encode(&password));
    }
    if let Some(realm) = realm {
        form.set("realm", &http::url_encode(realm));
    }

    let answer = logincheck(carrier, host, cookies, &form, timeout)?;
    require_status(&answer, &[200, 401, 403])?;

    let mut params = RetParams::parse(&answer.text());
    let Some(mut ret) = params.ret() else {
        // Pre-FortiOS-4 firmware answers without a ret code; the cookie
        // itself tells whether the login worked.
        if cookies.has(SESSION_COOKIE) {
            log::info!("authenticated (legacy portal)");
            return Ok(());
        }
        return Err(Error::Http(HttpError::Malformed("no ret code")));
    };

    for _ in 0..LOGIN_STEP_LIMIT {
        log::debug!("logincheck ret={}", ret);
        match ret {
            // Access denied; the reason rides in the redirect query.
            0 => {
                let message = params
                    .get_decoded("redir")
                    .and_then(|redir| login::query_param(&redir, "err"))
                    .unwrap_or_else(|| "access denied".to_string());
                return Err(Error::AccessDenied(message));
            }

            // Access granted; following the redirect sets the cookie.
            1 => {
                let redir = match params.echo("redir") {
                    "" => "/remote/index".to_string(),
                    redir => redir.to_string(),
                };
                let answer =
                    exchange(carrier, host, cookies, "GET", &redir, &[], b"", timeout)?;
                require_status(&answer, &[200])?;

                if !cookies.has(SESSION_COOKIE) {
                    return Err(Error::Http(HttpError::Malformed("no session cookie")));
                }
                log::info!("authenticated");
                return Ok(());
            }

            // FortiToken / email OTP / SMS OTP.
            2 | 3 | 4 => {
                let prompt = match params.get_decoded("tokeninfo") {
                    Some(device) => format!("Authentication code for {}", device),
                    None => "Authentication code".to_string(),
                };
                let code = prompts.ask_code(&prompt).ok_or(Error::LoginCancelled)?;

                form.set_secret("code", &code);
                form.set("code2", "");
                form.set("realm", params.echo("realm"));
                form.set("reqid", params.echo("reqid"));
                form.set("polid", params.echo("polid"));
                form.set("grp", params.echo("grp"));
            }

            // The token drifted; the portal wants the next code.
            5 => {
                let code = prompts
                    .ask_code("Next authentication code")
                    .ok_or(Error::LoginCancelled)?;

                form.set("code", "");
                form.set_secret("code2", &code);
                form.set("realm", params.echo("realm"));
                form.set("reqid", params.echo("reqid"));
                form.set("polid", params.echo("polid"));
                form.set("grp", params.echo("grp"));
            }

            // Challenge (or an expired password, which is terminal).
            6 => {
                if params.get("pass_renew") == Some("1") {
                    return Err(Error::AccessDenied("password expired".to_string()));
                }
                let prompt = params
                    .get_decoded("chal_msg")
                    .unwrap_or_else(|| "enter code".to_string());
                let code = prompts.ask_code(&prompt).ok_or(Error::LoginCancelled)?;

                form.set_secret("credential2", &code);
                form.set("magic", params.echo("magic"));
                form.set(
                    "reqid",
                    &format!(
                        "{},{},{}",
                        params.echo("reqid"),
                        params.echo("polid"),
                        params.echo("sp_polid")
                    ),
                );
                form.set(
                    "grpid",
                    &format!(
                        "{},{},{}",
                        params.echo("grpid"),
                        params.echo("pid"),
                        params.echo("usr_only_check")
                    ),
                );
                form.set("realm", params.echo("realm"));
            }

            other => return Err(Error::UnexpectedRetCode(other)),
        }

        // The MFA arms fall through to the next round trip.
        let answer = logincheck(carrier, host, cookies, &form, timeout)?;
        require_status(&answer, &[200])?;
        params = RetParams::parse(&answer.text());
        ret = params.ret().ok_or(Error::Http(HttpError::Malformed("no ret code")))?;
    }

    Err(Error::UnexpectedRetCode(ret))
}

// ============================================================================
// Portal client
// ============================================================================

/// Identity facts from `/remote/portal?access`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalInfo {
    /// Logged-in user.
    pub user: String,
    /// Portal group.
    pub group: String,
    /// FortiOS version string.
    pub version: String,
}

/// Authenticated session against one Fortigate portal.
pub struct PortalClient {
    carrier: PortalCarrier,
    host: String,
    realm: Option<String>,
    cookies: CookieJar,
    authenticated: bool,
    /// Identity provider URL when the preflight was redirected off the
    /// firewall; password login is unavailable until SAML completes.
    saml_url: Option<String>,
    timeout: Duration,
}

impl PortalClient {
    /// Connect, verify the certificate policy and run the preflight.
    pub fn open(
        endpoint: &Endpoint,
        settings: &TlsSettings,
        confirm: Option<ConfirmCert>,
        realm: Option<&str>,
    ) -> Result<Self> {
        let connector = TlsConnector::new(settings, confirm)?;

        log::info!("connecting to {}", endpoint);
        let socket = connector.connect(endpoint, PORTAL_TIMEOUT)?;
        let pinned = socket
            .fingerprint()
            .ok_or_else(|| Error::Tls(rustls::Error::General("no peer certificate".into())))?;

        log::info!(
            "protocol {} cipher {}",
            socket.version().unwrap_or_else(|| "?".into()),
            socket.cipher().unwrap_or_else(|| "?".into())
        );
        if socket.verify_mask() != 0 {
            log::warn!(
                "peer certificate accepted by override (mask 0x{:04x})",
                socket.verify_mask()
            );
        }

        let mut client = Self {
            carrier: PortalCarrier {
                connector,
                endpoint: endpoint.clone(),
                socket,
                pinned,
                timeout: PORTAL_TIMEOUT,
            },
            host: endpoint.to_string(),
            realm: realm.map(str::to_string),
            cookies: CookieJar::new(),
            authenticated: false,
            saml_url: None,
            timeout: PORTAL_TIMEOUT,
        };

        // A preflight redirect to an identity provider is not fatal: the
        // client stays usable so the SAML flow can complete on it.
        match client.preflight() {
            Ok(()) => {}
            Err(Error::SamlRedirect(url)) => client.saml_url = Some(url),
            Err(e) => return Err(e),
        }
        Ok(client)
    }

    /// Fingerprint pinned at the initial connect.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.carrier.pinned
    }

    /// True once `login` succeeded.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// `GET /` (or `/{realm}/`), following up to two redirects.
    ///
    /// A redirect off the firewall's origin is the SAML sign-on case and
    /// surfaces as [`Error::SamlRedirect`] carrying the identity
    /// provider URL; drive it through a web view and finish with
    /// [`complete_saml`].
    ///
    /// [`complete_saml`]: PortalClient::complete_saml
    fn preflight(&mut self) -> Result<()> {
        let mut path = match &self.realm {
            Some(realm) => format!("/{}/", realm),
            None => "/".to_string(),
        };

        for _ in 0..3 {
            let answer = exchange(
                &mut self.carrier,
                &self.host,
                &mut self.cookies,
                "GET",
                &path,
                &[],
                b"",
                self.timeout,
            )?;
            match answer.status {
                200 => return Ok(()),
                301 | 302 | 303 | 307 => {
                    let location = answer
                        .header("location")
                        .ok_or(Error::Http(HttpError::Malformed("redirect without location")))?;
                    path = match redirect_target(location, &self.host) {
                        RedirectTarget::Portal(path) => path,
                        RedirectTarget::External(url) => {
                            log::info!("portal delegates sign-on to {}", url);
                            return Err(Error::SamlRedirect(url));
                        }
                    };
                }
                code => return Err(Error::Http(HttpError::Status(code, answer.reason))),
            }
        }
        Err(Error::Http(HttpError::Malformed("too many redirects")))
    }

    /// Identity provider URL when the portal delegates sign-on to SAML.
    pub fn saml_url(&self) -> Option<&str> {
        self.saml_url.as_deref()
    }

    /// Complete an externally performed SAML sign-on: install the
    /// session cookie the web view obtained and mark the session
    /// authenticated.
    pub fn complete_saml(&mut self, session_cookie: &str) -> Result<()> {
        if session_cookie.is_empty() {
            return Err(Error::AccessDenied("empty session cookie".to_string()));
        }
        self.cookies
            .store(&format!("{}={}", SESSION_COOKIE, session_cookie));
        self.saml_url = None;
        self.authenticated = true;
        log::info!("authenticated (saml)");
        Ok(())
    }

    /// Authenticate; prompts supply credentials and MFA codes.
    ///
    /// When the portal delegated sign-on to an identity provider this
    /// returns [`Error::SamlRedirect`]; run the URL through a web view
    /// and call [`complete_saml`] instead.
    ///
    /// [`complete_saml`]: PortalClient::complete_saml
    pub fn login(&mut self, prompts: &mut dyn LoginPrompts) -> Result<()> {
        if let Some(url) = &self.saml_url {
            return Err(Error::SamlRedirect(url.clone()));
        }
        self.authenticated = false;
        login_flow(
            &mut self.carrier,
            &self.host,
            self.realm.as_deref(),
            &mut self.cookies,
            prompts,
            self.timeout,
        )?;
        self.authenticated = true;
        Ok(())
    }

    /// Fetch user/group/version facts; requires authentication.
    pub fn portal_info(&mut self) -> Result<PortalInfo> {
        let answer = exchange(
            &mut self.carrier,
            &self.host,
            &mut self.cookies,
            "GET",
            "/remote/portal?access",
            &[],
            b"",
            self.timeout,
        )?;
        require_status(&answer, &[200])?;

        let body = answer.text();
        Ok(PortalInfo {
            user: json_str(&body, "user").unwrap_or_default(),
            group: json_str(&body, "group").unwrap_or_default(),
            version: json_str(&body, "version").unwrap_or_default(),
        })
    }

    /// Forget the session cookie.
    pub fn logoff(&mut self) {
        self.authenticated = false;
        self.cookies.clear();
    }

    /// Ask the firewall to switch the connection to tunnel mode and hand
    /// the socket over. After this no HTTP is valid on the socket; the
    /// next bytes on it are framed PPP.
    pub fn start_tunnel_mode(mut self) -> Result<TlsSocket> {
        if !self.authenticated {
            return Err(Error::AccessDenied("not authenticated".to_string()));
        }

        let wire = write_request(
            "GET",
            "/remote/sslvpn-tunnel",
            "sslvpn",
            self.cookies.header_value().as_deref(),
            &[],
            b"",
        );
        self.carrier.socket.send_all(&wire, self.timeout)?;

        log::info!("tunnel mode requested");
        Ok(self.carrier.socket)
    }
}

/// Pull a `"key":"value"` string out of the portal's small JSON bodies.
/// Enough for `/remote/portal?access`; not a JSON parser.
fn json_str(body: &str, key: &str) -> Option<String> {
    let needle = format!("\"{}\"", key);
    let after_key = &body[body.find(&needle)? + needle.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?.trim_start();
    let inner = after_colon.strip_prefix('"')?;
    Some(inner[..inner.find('"')?].to_string())
}

// ============================================================================
// Tests
// ============================================================================
