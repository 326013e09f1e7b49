use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use derivative::Derivative;
use derive_builder::Builder;
use derive_more::Display;
use log::{debug, info, warn};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
  AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
  PkceCodeVerifier, RedirectUrl, RequestTokenError, Scope, TokenUrl,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tiny_http::{Header, Request, Response, Server};
use url::Url;

use crate::{Error, Result};

pub const LOGIN_URL: &str = "https://login.eveonline.com";

pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/callback";

pub const DEFAULT_REDIRECT_ADDR: &str = "127.0.0.1:8080";

const SUCCESS_PAGE: &str = "Authorization successful! You can close this window now.";
const FAILURE_PAGE: &str = "Authorization failed. Please try again.";
const UNKNOWN_PATH_PAGE: &str = "Invalid callback path.";

/// Scopes the SSO can grant, as defined at <https://developers.eveonline.com>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EsiScope {
  #[display(fmt = "publicData")]
  PublicData,
  #[display(fmt = "esi-killmails.read_killmails.v1")]
  ReadKillmails,
}

#[derive(Derivative, Builder)]
#[derivative(Debug)]
#[builder(setter(into))]
/// EVE SSO Config
pub struct SsoConfig<'a> {
  /// Client ID of an application registered at <https://developers.eveonline.com>
  ///
  /// **Required**
  client_id: Cow<'a, str>,
  #[derivative(Debug = "ignore")]
  /// Client Secret of the registered application
  ///
  /// **Required**
  client_secret: Cow<'a, str>,
  #[builder(setter(custom), default)]
  /// Redirect URL registered for the application
  ///
  /// **Optional**
  redirect_url: Option<Url>,
  #[builder(setter(custom), default)]
  /// Address the callback listener binds, must cover the redirect URL's port
  ///
  /// **Optional**
  redirect_addr: Option<SocketAddr>,
  #[builder(default = "LOGIN_URL.into()")]
  /// Base URL of the SSO service
  ///
  /// **Optional**
  login_url: Cow<'a, str>,
  #[builder(default)]
  /// How long to wait for the authorization callback, forever when unset
  ///
  /// **Optional**
  callback_timeout: Option<Duration>,
}

impl<'a> SsoConfigBuilder<'a> {
  pub fn redirect_url(&mut self, url: &str) -> Result<&mut Self> {
    self.redirect_url = Some(Some(url.parse()?));

    Ok(self)
  }

  pub fn redirect_addr(&mut self, addr: &str) -> Result<&mut Self> {
    self.redirect_addr = Some(Some(addr.parse()?));

    Ok(self)
  }
}

#[derive(Debug)]
pub struct SsoClient {
  oauth: BasicClient,
  redirect_addr: SocketAddr,
  callback_path: String,
  callback_timeout: Option<Duration>,
}

impl SsoClient {
  pub fn new(
    SsoConfig {
      client_id,
      client_secret,
      redirect_url,
      redirect_addr,
      login_url,
      callback_timeout,
      ..
    }: SsoConfig<'_>,
  ) -> Result<Self> {
    let redirect_url: Url = match redirect_url {
      Some(url) => url,
      None => DEFAULT_REDIRECT_URL.parse()?,
    };
    let redirect_addr: SocketAddr = match redirect_addr {
      Some(addr) => addr,
      None => DEFAULT_REDIRECT_ADDR.parse()?,
    };
    let callback_path = redirect_url.path().to_owned();

    let oauth = BasicClient::new(
      ClientId::new(client_id.into_owned()),
      Some(ClientSecret::new(client_secret.into_owned())),
      AuthUrl::new(format!("{login_url}/v2/oauth/authorize/"))?,
      Some(TokenUrl::new(format!("{login_url}/v2/oauth/token"))?),
    )
    // The SSO wants the client credentials in the form body, not basic auth.
    .set_auth_type(AuthType::RequestBody)
    .set_redirect_uri(RedirectUrl::from_url(redirect_url));

    Ok(Self {
      oauth,
      redirect_addr,
      callback_path,
      callback_timeout,
    })
  }

  /// Runs the whole authorization-code flow. Binds the callback listener,
  /// hands the authorization URL to `open_url` (print it, open a browser),
  /// waits for the redirect and exchanges the captured code for tokens.
  ///
  /// The flow uses PKCE and a random `state`, and a redirect whose state does
  /// not match fails the run.
  pub async fn get_token<S, F>(&self, scopes: S, open_url: F) -> Result<BasicTokenResponse>
  where
    S: IntoIterator<Item = EsiScope>,
    F: FnOnce(&Url) -> Result<()>,
  {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut request = self.oauth.authorize_url(CsrfToken::new_random);

    for scope in scopes {
      request = request.add_scope(Scope::new(scope.to_string()));
    }

    let (url, state) = request.set_pkce_challenge(challenge).url();

    let server =
      CallbackServer::bind(self.redirect_addr, &self.callback_path, self.callback_timeout)?;

    open_url(&url)?;

    let code = server.recv_code(&state).await?;

    self.exchange_code(code, verifier).await
  }

  async fn exchange_code(
    &self,
    code: String,
    verifier: PkceCodeVerifier,
  ) -> Result<BasicTokenResponse> {
    debug!("exchanging the authorization code");

    self
      .oauth
      .exchange_code(AuthorizationCode::new(code))
      .set_pkce_verifier(verifier)
      .request_async(async_http_client)
      .await
      .map_err(|err| match err {
        RequestTokenError::ServerResponse(response) => Error::TokenExchange(response.to_string()),
        other => Error::TokenExchange(other.to_string()),
      })
  }
}

/// Short-lived local HTTP listener for the SSO redirect. The bound socket is
/// released as soon as [`CallbackServer::recv_code`] returns, on the error
/// paths too.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CallbackServer {
  #[derivative(Debug = "ignore")]
  server: Server,
  path: String,
  timeout: Option<Duration>,
}

impl CallbackServer {
  pub fn bind(addr: SocketAddr, path: &str, timeout: Option<Duration>) -> Result<Self> {
    let server = Server::http(addr).map_err(|err| Error::BindError {
      addr,
      reason: err.to_string(),
    })?;

    info!("listening for the authorization callback on {addr}");

    Ok(Self {
      server,
      path: path.to_owned(),
      timeout,
    })
  }

  /// The address the listener actually bound, handy when the port was 0.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.server.server_addr().to_ip()
  }

  /// Waits for the redirect request, answers the browser and returns the
  /// authorization code. Requests for other paths are answered with a 404
  /// and the wait goes on; they do not push the timeout deadline back.
  pub async fn recv_code(self, state: &CsrfToken) -> Result<String> {
    let expected_state = state.secret().clone();
    let Self { server, path, timeout } = self;

    tokio::task::spawn_blocking(move || recv_code_blocking(server, &path, timeout, &expected_state))
      .await
      .map_err(|err| Error::IoError(std::io::Error::new(std::io::ErrorKind::Other, err)))?
  }
}

fn recv_code_blocking(
  server: Server,
  path: &str,
  timeout: Option<Duration>,
  expected_state: &str,
) -> Result<String> {
  let deadline = timeout.map(|timeout| Instant::now() + timeout);

  loop {
    let request = match deadline {
      Some(deadline) => {
        let remaining = deadline.saturating_duration_since(Instant::now());

        if remaining.is_zero() {
          return Err(Error::CallbackTimeout);
        }

        match server.recv_timeout(remaining)? {
          Some(request) => request,
          None => return Err(Error::CallbackTimeout),
        }
      }
      None => server.recv()?,
    };

    // tiny_http hands the path and query out as one string.
    let url: Url = match format!("http://localhost{}", request.url()).parse() {
      Ok(url) => url,
      Err(err) => {
        debug!("ignoring a request with an unparseable target: {err}");
        respond(request, 404, UNKNOWN_PATH_PAGE);
        continue;
      }
    };

    if url.path() != path {
      debug!("ignoring a request for {}", url.path());
      respond(request, 404, UNKNOWN_PATH_PAGE);
      continue;
    }

    let query: HashMap<_, _> = url.query_pairs().into_owned().collect();

    match parse_callback(&query, expected_state) {
      Ok(code) => {
        info!("authorization code received");
        respond(request, 200, SUCCESS_PAGE);

        return Ok(code);
      }
      Err(err) => {
        warn!("rejecting the callback: {err}");
        respond(request, 200, FAILURE_PAGE);

        return Err(err);
      }
    }
  }
}

fn parse_callback(query: &HashMap<String, String>, expected_state: &str) -> Result<String> {
  if let Some(error) = query.get("error") {
    let description = query.get("error_description").unwrap_or(error).clone();

    return Err(Error::AuthorizationDenied(description));
  }

  match query.get("state") {
    Some(state) if state == expected_state => {}
    _ => return Err(Error::StateMismatch),
  }

  query.get("code").cloned().ok_or(Error::MissingAuthorizationCode)
}

fn respond(request: Request, status: u16, page: &str) {
  let response = Response::from_string(page)
    .with_status_code(status)
    .with_header(content_type_html());

  if let Err(err) = request.respond(response) {
    warn!("could not answer the callback request: {err}");
  }
}

fn content_type_html() -> Header {
  Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
    .expect("static header is valid")
}

/// Identity claims the SSO embeds in an access token.
#[derive(Debug, Clone)]
pub struct CharacterClaims {
  pub character_id: u64,
  pub character_name: String,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
  sub: String,
  #[serde(default = "unknown_name")]
  name: String,
}

fn unknown_name() -> String {
  "Unknown".to_owned()
}

/// Decodes the identity claims out of an SSO access token. The token is a
/// JWT whose `sub` claim reads `CHARACTER:EVE:<id>`. Only the payload is
/// decoded, the signature is not verified.
pub fn decode_character_claims(access_token: &str) -> Result<CharacterClaims> {
  let payload = access_token
    .split('.')
    .nth(1)
    .ok_or_else(|| Error::MalformedToken("not a JWT".to_owned()))?;

  let payload = URL_SAFE_NO_PAD
    .decode(payload.trim_end_matches('='))
    .map_err(|err| Error::MalformedToken(err.to_string()))?;

  let claims: JwtClaims =
    serde_json::from_slice(&payload).map_err(|err| Error::MalformedToken(err.to_string()))?;

  let character_id = claims
    .sub
    .rsplit(':')
    .next()
    .and_then(|id| id.parse().ok())
    .ok_or_else(|| Error::MalformedToken(format!("unexpected subject {:?}", claims.sub)))?;

  Ok(CharacterClaims {
    character_id,
    character_name: claims.name,
  })
}
