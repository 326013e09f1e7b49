use chrono::{DateTime, Duration, Utc};
use derivative::Derivative;
use log::debug;
use oauth2::basic::BasicTokenResponse;
use oauth2::TokenResponse;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::sso::CharacterClaims;
use crate::Result;

pub const TOKEN_FILE: &str = "eve_tokens.json";

/// Tokens and character identity one authorization run produced. Each run
/// overwrites the previous file, there is no multi-character bookkeeping.
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct TokenRecord {
  #[derivative(Debug = "ignore")]
  pub access_token: String,
  #[derivative(Debug = "ignore")]
  pub refresh_token: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub character_id: u64,
  pub character_name: String,
}

impl TokenRecord {
  pub fn new(token: &BasicTokenResponse, claims: &CharacterClaims, now: DateTime<Utc>) -> Self {
    let expires_at = token
      .expires_in()
      .and_then(|expires_in| Duration::from_std(expires_in).ok())
      .map(|expires_in| now + expires_in);

    Self {
      access_token: token.access_token().secret().clone(),
      refresh_token: token.refresh_token().map(|token| token.secret().clone()),
      expires_at,
      character_id: claims.character_id,
      character_name: claims.character_name.clone(),
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    matches!(self.expires_at, Some(expires_at) if expires_at <= now)
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    debug!("writing tokens to {}", path.display());

    let json = serde_json::to_string_pretty(self)?;

    fs::write(path, json).map_err(Into::into)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();

    debug!("reading tokens from {}", path.display());

    let json = fs::read_to_string(path)?;

    serde_json::from_str(&json).map_err(Into::into)
  }
}
