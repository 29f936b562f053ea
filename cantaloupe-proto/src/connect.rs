use alloc::string::String;

use serde::Serialize;

/// The JSON body of the `CONNECT` command
#[derive(Debug, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Connect {
    /// Ask the server to reply `+OK` to every well-formed command
    pub verbose: bool,
    /// Ask the server to perform additional protocol checks
    pub pedantic: bool,
    #[serde(rename = "tls_required")]
    pub require_tls: bool,
    pub auth_token: Option<String>,
    #[serde(rename = "user")]
    pub username: Option<String>,
    #[serde(rename = "pass")]
    pub password: Option<String>,
    #[serde(rename = "name")]
    pub client_name: Option<String>,
    #[serde(rename = "lang")]
    pub client_lang: &'static str,
    #[serde(rename = "version")]
    pub client_version: &'static str,
    /// The client protocol level. Level 1 enables asynchronous `INFO`
    /// updates carrying the evolving server list.
    pub protocol: u8,
    /// Whether messages published by this connection may be delivered
    /// back to its own subscriptions
    pub echo: bool,
    /// Signature over the server provided nonce, when authenticating
    /// with an nkey or JWT
    #[serde(rename = "sig")]
    pub signature: Option<String>,
    pub jwt: Option<String>,
    #[serde(rename = "no_responders")]
    pub supports_no_responders: bool,
    #[serde(rename = "headers")]
    pub supports_headers: bool,
    pub nkey: Option<String>,
}
