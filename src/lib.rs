use chrono::{DateTime, Duration, Utc};
use derive_builder::Builder;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::SocketAddr;
use thiserror::Error;

pub mod sso;
pub mod tokens;

pub const API_URL: &str = "https://esi.evetech.net/latest";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Builder)]
#[builder(setter(into))]
/// EVE ESI Api Config
pub struct EveApiConfig<'a> {
  /// Access Token
  ///
  /// **Required**
  access_token: Cow<'a, str>,
  /// Character ID the killmail endpoints are scoped to
  ///
  /// **Required**
  character_id: u64,
  #[builder(default = "API_URL.into()")]
  /// Base URL of the ESI service
  ///
  /// **Optional**
  api_url: Cow<'a, str>,
  #[builder(default = "USER_AGENT.into()")]
  /// User Agent, ESI asks that it identify the caller
  ///
  /// **Optional**
  user_agent: Cow<'a, str>,
  #[builder(default)]
  /// Custom headers
  ///
  /// **Optional**
  custom_headers: HeaderMap,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiApiError {
  error: String,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  ReqwestError(#[from] reqwest::Error),
  #[error(transparent)]
  ReqwestInvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
  #[error(transparent)]
  UrlParseError(#[from] url::ParseError),
  #[error(transparent)]
  AddrParseError(#[from] std::net::AddrParseError),
  #[error(transparent)]
  JsonError(#[from] serde_json::Error),
  #[error(transparent)]
  IoError(#[from] std::io::Error),
  #[error("ESI request failed ({status}): {error}")]
  EsiError { status: StatusCode, error: String },
  #[error("could not bind the callback listener on {addr}: {reason}")]
  BindError { addr: SocketAddr, reason: String },
  #[error("timed out waiting for the authorization callback")]
  CallbackTimeout,
  #[error("callback request carried no authorization code")]
  MissingAuthorizationCode,
  #[error("callback state did not match the one sent with the authorization request")]
  StateMismatch,
  #[error("authorization was denied: {0}")]
  AuthorizationDenied(String),
  #[error("token exchange failed: {0}")]
  TokenExchange(String),
  #[error("malformed access token: {0}")]
  MalformedToken(String),
}

#[derive(Debug)]
pub struct EveApi {
  client: Client,
  character_id: u64,
  api_url: String,
}

/// One entry of the recent-killmail list. The list covers kills and losses
/// alike, so an entry alone does not say which side the character was on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillmailRef {
  pub killmail_id: u64,
  pub killmail_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Killmail {
  pub killmail_id: u64,
  pub killmail_time: DateTime<Utc>,
  pub victim: Victim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Victim {
  pub character_id: Option<u64>,
  pub ship_type_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
  pub name: String,
}

/// The character's most recent loss, with the ship name resolved when possible.
#[derive(Debug, Clone)]
pub struct LossReport {
  pub killmail: Killmail,
  pub ship_name: Option<String>,
}

impl LossReport {
  pub fn summary(&self, now: DateTime<Utc>) -> String {
    let age = now - self.killmail.killmail_time;
    let mut text = format!("Time since last ship loss: {}", format_loss_age(age));

    if let Some(name) = &self.ship_name {
      text.push_str(&format!("\nLost ship: {name}"));
    }

    text
  }
}

impl EveApi {
  pub fn new(
    EveApiConfig {
      access_token,
      character_id,
      api_url,
      user_agent,
      custom_headers,
      ..
    }: EveApiConfig<'_>,
  ) -> Result<Self> {
    let mut headers = custom_headers;
    let authorization = format!("Bearer {access_token}");
    let mut authorization = HeaderValue::from_str(&authorization)?;

    authorization.set_sensitive(true);

    headers.insert(AUTHORIZATION, authorization);

    let client = ClientBuilder::new()
      .user_agent(user_agent.as_ref())
      .default_headers(headers)
      .redirect(Policy::none())
      .build()?;

    Ok(Self {
      client,
      character_id,
      api_url: api_url.into_owned(),
    })
  }

  fn api_url(&self, endpoint: &str) -> Result<Url> {
    format!("{}{endpoint}", self.api_url).parse().map_err(Into::into)
  }

  fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
    let url = self.api_url(endpoint)?;

    Ok(self.client.request(method, url))
  }

  fn get(&self, endpoint: &str) -> Result<RequestBuilder> {
    self.request(Method::GET, endpoint)
  }

  async fn fetch<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
    debug!("GET {endpoint}");

    let response: Response = self.get(endpoint)?.send().await?;

    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
      let error = match response.json::<EsiApiError>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_owned(),
      };

      return Err(Error::EsiError { status, error });
    }

    response.json().await.map_err(Into::into)
  }

  /// Killmail references for the configured character, newest first.
  pub async fn get_recent_killmails(&self) -> Result<Vec<KillmailRef>> {
    let endpoint = format!("/characters/{}/killmails/recent/", self.character_id);

    self.fetch(&endpoint).await
  }

  pub async fn get_killmail_details(
    &self,
    killmail_id: u64,
    killmail_hash: &str,
  ) -> Result<Killmail> {
    let endpoint = format!("/killmails/{killmail_id}/{killmail_hash}/");

    self.fetch(&endpoint).await
  }

  pub async fn get_ship_info(&self, ship_type_id: u64) -> Result<TypeInfo> {
    let endpoint = format!("/universe/types/{ship_type_id}/");

    self.fetch(&endpoint).await
  }

  /// Looks up the detail record of every recent killmail and keeps the ones
  /// where the configured character was the victim.
  pub async fn recent_losses(&self) -> Result<Vec<Killmail>> {
    let recent = self.get_recent_killmails().await?;
    let mut losses = Vec::new();

    for entry in recent {
      let killmail = self
        .get_killmail_details(entry.killmail_id, &entry.killmail_hash)
        .await?;

      if killmail.victim.character_id == Some(self.character_id) {
        losses.push(killmail);
      }
    }

    Ok(losses)
  }

  /// The character's most recent loss, or `None` when there is none on record.
  pub async fn last_loss(&self) -> Result<Option<LossReport>> {
    let losses = self.recent_losses().await?;

    let Some(killmail) = most_recent_loss(&losses).cloned() else {
      return Ok(None);
    };

    let ship_name = match killmail.victim.ship_type_id {
      // A failed name lookup should not hide the loss itself.
      Some(type_id) => self.get_ship_info(type_id).await.ok().map(|ship| ship.name),
      None => None,
    };

    Ok(Some(LossReport { killmail, ship_name }))
  }
}

pub fn most_recent_loss(losses: &[Killmail]) -> Option<&Killmail> {
  losses.iter().max_by_key(|killmail| killmail.killmail_time)
}

/// Spells a loss age out as `2 days, 3 hours, 45 minutes, 30 seconds`,
/// dropping zero-valued units. Seconds always appear.
pub fn format_loss_age(age: Duration) -> String {
  let days = age.num_days();
  let hours = age.num_hours() % 24;
  let minutes = age.num_minutes() % 60;
  let seconds = age.num_seconds() % 60;

  let mut parts = Vec::new();

  if days > 0 {
    parts.push(plural(days, "day"));
  }
  if hours > 0 {
    parts.push(plural(hours, "hour"));
  }
  if minutes > 0 {
    parts.push(plural(minutes, "minute"));
  }
  parts.push(plural(seconds, "second"));

  parts.join(", ")
}

fn plural(amount: i64, unit: &str) -> String {
  if amount == 1 {
    format!("1 {unit}")
  } else {
    format!("{amount} {unit}s")
  }
}
