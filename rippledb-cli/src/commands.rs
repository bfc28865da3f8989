//! Command execution.

use crate::Commands;
use colored::Colorize;
use rippledb_client::json::{from_json, to_json};
use rippledb_client::{Client, WriteResult};
use rmpv::Value as MsgValue;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Status => {
            let status = client.status().await?;
            Ok(format_json(&to_json(&status)))
        }

        Commands::Select {
            space,
            key,
            limit,
            offset,
        } => {
            let key = match key {
                Some(key) => parse_array_arg(&key)?,
                None => Vec::new(),
            };
            let tuples = client
                .select(space, key, limit.unwrap_or(u32::MAX), offset)
                .await?;
            if tuples.is_empty() {
                return Ok("No tuples".yellow().to_string());
            }
            Ok(tuples
                .iter()
                .map(|t| to_json(t).to_string())
                .collect::<Vec<_>>()
                .join("\n"))
        }

        Commands::Insert { space, tuple } => {
            let result = client.insert(space, parse_array_arg(&tuple)?).await?;
            Ok(format_write("Inserted", &result))
        }

        Commands::Replace { space, tuple } => {
            let result = client.replace(space, parse_array_arg(&tuple)?).await?;
            Ok(format_write("Replaced", &result))
        }

        Commands::Upsert { space, tuple, ops } => {
            let result = client
                .upsert(space, parse_array_arg(&tuple)?, parse_array_arg(&ops)?)
                .await?;
            Ok(format_write("Upserted", &result))
        }

        Commands::Delete { space, key } => {
            let result = client.delete(space, parse_array_arg(&key)?).await?;
            if result.tuples.is_empty() {
                return Ok(format!("{}: no tuple with that key", "Warning".yellow()));
            }
            Ok(format_write("Deleted", &result))
        }

        Commands::WaitLsn {
            replica_id,
            lsn,
            wait,
        } => {
            let vclock = client
                .wait_lsn(replica_id, lsn, Duration::from_secs(wait))
                .await?;
            Ok(format!(
                "{} {}:{} (vclock {})",
                "Reached".green(),
                replica_id,
                lsn,
                vclock
            ))
        }

        // Handled in main.rs before connecting
        Commands::HashToken { .. } => unreachable!(),
    }
}

/// Lowercase hex SHA-256 of `token`, as stored in `token_hash`.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn format_write(verb: &str, result: &WriteResult) -> String {
    let output = json!({
        "replica_id": result.replica_id,
        "lsn": result.lsn,
        "tuples": result.tuples.iter().map(to_json).collect::<Vec<_>>(),
    });
    format!("{} {}", verb.green(), output)
}

/// Parses a JSON array argument (either inline JSON or @file.json).
fn parse_array_arg(arg: &str) -> Result<Vec<MsgValue>, Box<dyn std::error::Error>> {
    let json: Value = if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };
    match from_json(&json) {
        MsgValue::Array(items) => Ok(items),
        _ => Err(format!("expected a JSON array, got {json}").into()),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_parse_array_arg() {
        let tuple = parse_array_arg(r#"[1, "bob", [2, 3]]"#).unwrap();
        assert_eq!(tuple.len(), 3);
        assert_eq!(tuple[1], MsgValue::from("bob"));
        assert!(parse_array_arg(r#"{"a": 1}"#).is_err());
        assert!(parse_array_arg("not json").is_err());
    }
}
