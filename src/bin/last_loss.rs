use anyhow::Context;
use chrono::Utc;
use eve_api::tokens::{TokenRecord, TOKEN_FILE};
use eve_api::{EveApi, EveApiConfigBuilder};
use std::env;
use std::process;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  env_logger::Builder::new()
    .filter_level(log::LevelFilter::Warn)
    .parse_default_env()
    .init();

  let args: Vec<String> = env::args().collect();

  let (access_token, character_id) = match args.len() {
    // No arguments: fall back to the record get_token saved.
    1 => {
      let record = TokenRecord::load(TOKEN_FILE)
        .with_context(|| format!("could not read {TOKEN_FILE}, run get_token first"))?;

      if record.is_expired(Utc::now()) {
        eprintln!("Warning: the saved access token has expired, run get_token again.");
      }

      (record.access_token, record.character_id)
    }
    3 => {
      let character_id = args[2]
        .parse()
        .with_context(|| format!("character id must be a number, got {:?}", args[2]))?;

      (args[1].clone(), character_id)
    }
    _ => {
      eprintln!("Usage: last_loss [<access_token> <character_id>]");
      process::exit(2);
    }
  };

  let config = EveApiConfigBuilder::default()
    .access_token(access_token)
    .character_id(character_id)
    .build()?;
  let api = EveApi::new(config)?;

  let killmails = api.get_recent_killmails().await?;

  match killmails.first() {
    Some(killmail) => println!(
      "Most recent killmail: {} (hash {})",
      killmail.killmail_id, killmail.killmail_hash
    ),
    None => println!("No ship losses found for this character."),
  }

  Ok(())
}
