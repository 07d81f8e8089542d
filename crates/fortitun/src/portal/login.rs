// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Login exchange building blocks: credentials, prompt callbacks, the
//! `key=value` response body and the URL-encoded form bodies.
//!
//! The Fortigate answers `/remote/logincheck` with an ASCII body like
//! `ret=3,tokeninfo=foo%40bar,reqid=abc`; the integer `ret` drives the
//! next step of the state machine in the portal client. The alphabet is
//! closed, so the transitions live in one explicit match there; this
//! module only supplies the data plumbing.

use zeroize::Zeroizing;

use crate::portal::http::url_decode;
use crate::util::Secret;

/// Username and password for the primary login step.
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Password, wiped on drop.
    pub password: Secret,
}

/// Callbacks the login state machine uses to ask the operator for input.
/// Returning `None` cancels the login.
pub trait LoginPrompts {
    /// Ask for username and password.
    fn ask_credentials(&mut self) -> Option<Credentials>;

    /// Ask for a one-time code or challenge answer; `prompt` explains
    /// which (e.g. "Authentication code for foo@bar").
    fn ask_code(&mut self, prompt: &str) -> Option<Secret>;
}

// ============================================================================
// Response body
// ============================================================================

/// The comma-separated `key=value` body of a logincheck answer.
#[derive(Debug, Default)]
pub(crate) struct RetParams {
    params: Vec<(String, String)>,
}

impl RetParams {
    /// Parse a response body. Entries without `=` are ignored.
    pub fn parse(body: &str) -> Self {
        let params = body
            .split(',')
            .filter_map(|entry| {
                let (key, value) = entry.split_once('=')?;
                Some((key.trim().to_string(), value.to_string()))
            })
            .collect();
        Self { params }
    }

    /// The `ret` code, when present and numeric.
    pub fn ret(&self) -> Option<i64> {
        self.get("ret")?.parse().ok()
    }

    /// Raw value of a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// URL-decoded value of a key.
    pub fn get_decoded(&self, key: &str) -> Option<String> {
        self.get(key).map(url_decode)
    }

    /// Raw value or empty string, for fields echoed back verbatim.
    pub fn echo(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }
}

/// Extract a query parameter from a URL (already decoded input).
pub(crate) fn query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            return Some(url_decode(v));
        }
    }
    None
}

// ============================================================================
// Form bodies
// ============================================================================

/// Login form: ordered `key=value` fields with replace-on-set semantics.
///
/// The MFA steps re-POST the whole form with a few fields changed, so the
/// form persists across the exchange. Values are stored as given (the
/// caller URL-encodes where the portal expects it) and wiped on drop
/// because the password passes through here.
pub(crate) struct Form {
    fields: Vec<(String, Zeroizing<String>)>,
}

impl Form {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        let value = Zeroizing::new(value.to_string());
        if let Some(field) = self.fields.iter_mut().find(|(k, _)| k == key) {
            field.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
        self
    }

    /// Set a field from a secret (OTP code, challenge answer).
    pub fn set_secret(&mut self, key: &str, value: &Secret) -> &mut Self {
        let text = Zeroizing::new(String::from_utf8_lossy(value.expose()).into_owned());
        self.set(key, &text)
    }

    /// Join into a request body that wipes itself.
    pub fn body(&self) -> Secret {
        let mut body = Zeroizing::new(String::new());
        for (key, value) in &self.fields {
            if !body.is_empty() {
                body.push('&');
            }
            body.push_str(key);
            body.push('=');
            body.push_str(value);
        }
        Secret::new(body.as_bytes().to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::http::url_encode;

    #[test]
    fn test_parse_ret_body() {
        let params = RetParams::parse("ret=3,tokeninfo=foo%40bar,reqid=abc,polid=");
        assert_eq!(params.ret(), Some(3));
        assert_eq!(params.get("tokeninfo"), Some("foo%40bar"));
        assert_eq!(params.get_decoded("tokeninfo").as_deref(), Some("foo@bar"));
        assert_eq!(params.echo("polid"), "");
        assert_eq!(params.echo("missing"), "");
    }

    #[test]
    fn test_parse_body_without_ret() {
        let params = RetParams::parse("<html>old firmware</html>");
        assert_eq!(params.ret(), None);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param("/remote/login?err=Permission+denied&lang=en", "err").as_deref(),
            Some("Permission denied")
        );
        assert_eq!(query_param("/remote/login", "err"), None);
        assert_eq!(query_param("/remote/login?lang=en", "err"), None);
    }

    #[test]
    fn test_form_set_replaces_and_keeps_order() {
        let mut form = Form::new();
        form.set("ajax", "1")
            .set("username", &url_encode("al ice"))
            .set_secret("credential", &Secret::from("p@ss"));

        assert_eq!(
            std::str::from_utf8(form.body().expose()).unwrap(),
            "ajax=1&username=al%20ice&credential=p@ss"
        );

        // A later set replaces in place.
        form.set("credential", "");
        form.set("code", "123456");
        assert_eq!(
            std::str::from_utf8(form.body().expose()).unwrap(),
            "ajax=1&username=al%20ice&credential=&code=123456"
        );
    }
}
