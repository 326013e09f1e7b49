use anyhow::{bail, Context};
use chrono::Utc;
use eve_api::sso::{decode_character_claims, EsiScope, SsoClient, SsoConfigBuilder};
use eve_api::tokens::{TokenRecord, TOKEN_FILE};
use oauth2::TokenResponse;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  env_logger::Builder::new()
    .filter_level(log::LevelFilter::Info)
    .parse_default_env()
    .init();

  let (Ok(client_id), Ok(client_secret)) =
    (dotenvy::var("EVE_CLIENT_ID"), dotenvy::var("EVE_CLIENT_SECRET"))
  else {
    bail!("missing credentials, set EVE_CLIENT_ID and EVE_CLIENT_SECRET in a .env file");
  };

  let mut config = SsoConfigBuilder::default();

  config.client_id(client_id).client_secret(client_secret);

  if let Ok(url) = dotenvy::var("EVE_REDIRECT_URL") {
    config.redirect_url(&url)?;
  }

  if let Ok(addr) = dotenvy::var("EVE_REDIRECT_ADDR") {
    config.redirect_addr(&addr)?;
  }

  if let Ok(secs) = dotenvy::var("EVE_AUTH_TIMEOUT_SECS") {
    let secs = secs
      .parse()
      .context("EVE_AUTH_TIMEOUT_SECS must be a number of seconds")?;

    config.callback_timeout(Duration::from_secs(secs));
  }

  let sso = SsoClient::new(config.build()?)?;

  let token = sso
    .get_token([EsiScope::ReadKillmails], |url| {
      println!("Opening browser for EVE Online authorization...");

      if webbrowser::open(url.as_str()).is_err() {
        println!("Could not open a browser, visit this URL to authorize:\n{url}");
      }

      println!("Waiting for authorization...");

      Ok(())
    })
    .await?;

  if let Some(expires_in) = token.expires_in() {
    println!("Access token obtained! Expires in {} seconds", expires_in.as_secs());
  }

  println!("Access token: {}", token.access_token().secret());

  let claims = decode_character_claims(token.access_token().secret())?;

  println!();
  println!("Character Name: {}", claims.character_name);
  println!("Character ID: {}", claims.character_id);

  let record = TokenRecord::new(&token, &claims, Utc::now());

  record.save(TOKEN_FILE)?;

  println!();
  println!("Tokens saved to {TOKEN_FILE}");
  println!("You can now look up your latest loss with the last_loss command.");

  Ok(())
}
