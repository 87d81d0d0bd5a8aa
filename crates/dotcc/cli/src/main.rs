// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! DotCC CLI Tool
//!
//! Diagnostics for the row-level CC kernel: decode and encode packed version
//! words, and show the configuration a store would resolve.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotcc_common::Priority;
use dotcc_core::CcConfig;
use dotcc_core::priority::{MAX_DATA_VERSION, MAX_EPOCH, MAX_REF_COUNT, TidWord};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dotcc")]
#[command(about = "DotCC - Row-level concurrency control diagnostics")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fields of a packed version word
    Decode {
        /// Word as a decimal or 0x-prefixed hex number
        word: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pack fields into a version word
    Encode {
        /// Data version
        #[arg(long)]
        version: u64,
        /// Priority epoch
        #[arg(long, default_value_t = 0)]
        epoch: u16,
        /// Reserved priority level
        #[arg(long, default_value_t = 0)]
        priority: u8,
        /// Reservation count
        #[arg(long, default_value_t = 0)]
        refs: u32,
        /// Set the latch bit
        #[arg(long)]
        latched: bool,
    },
    /// Print the resolved configuration as TOML
    Config {
        /// Configuration file (overrides DOTCC_CONFIG)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode { word, json } => handle_decode(&word, json),
        Commands::Encode { version, epoch, priority, refs, latched } => handle_encode(version, epoch, priority, refs, latched),
        Commands::Config { config } => handle_config(config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

fn parse_word(input: &str) -> anyhow::Result<TidWord> {
    let input = input.trim().replace('_', "");
    let raw = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse::<u64>(),
    }
    .with_context(|| format!("'{input}' is not a 64-bit word"))?;
    Ok(TidWord::from_raw(raw))
}

fn describe(word: TidWord) -> String {
    format!(
        "word:         {word}\nlatched:      {}\nepoch:        {}\npriority:     {}\nref_count:    {}\ndata_version: {}",
        word.is_latched(),
        word.epoch(),
        word.priority().level(),
        word.ref_count(),
        word.data_version()
    )
}

fn handle_decode(input: &str, as_json: bool) -> anyhow::Result<()> {
    let word = parse_word(input)?;
    if as_json {
        let value = json!({
            "raw": word.raw(),
            "latched": word.is_latched(),
            "epoch": word.epoch(),
            "priority": word.priority().level(),
            "ref_count": word.ref_count(),
            "data_version": word.data_version(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", describe(word));
    }
    info!("Decoded word {}", word);
    Ok(())
}

fn encode(version: u64, epoch: u16, priority: u8, refs: u32, latched: bool) -> anyhow::Result<TidWord> {
    if version > MAX_DATA_VERSION {
        bail!("data version {version} exceeds {MAX_DATA_VERSION}");
    }
    if epoch > MAX_EPOCH {
        bail!("epoch {epoch} exceeds {MAX_EPOCH}");
    }
    if refs > MAX_REF_COUNT {
        bail!("reference count {refs} exceeds {MAX_REF_COUNT}");
    }
    let priority = Priority::new(priority)?;

    let word = TidWord::new(version)?.with_epoch(epoch).with_priority(priority).with_ref_count(refs);
    Ok(if latched { word.latched() } else { word })
}

fn handle_encode(version: u64, epoch: u16, priority: u8, refs: u32, latched: bool) -> anyhow::Result<()> {
    let word = encode(version, epoch, priority, refs, latched)?;
    println!("{word} ({})", word.raw());
    info!("Encoded word {}", word);
    Ok(())
}

fn handle_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = CcConfig::resolve(path)?;
    print!("{}", config.to_toml_string()?);
    info!("Resolved configuration for the {} algorithm", config.algorithm.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_word_formats() {
        assert_eq!(parse_word("268435457").unwrap().raw(), 0x1000_0001);
        assert_eq!(parse_word("0x10000001").unwrap().raw(), 0x1000_0001);
        assert_eq!(parse_word(" 0X1000_0001 ").unwrap().raw(), 0x1000_0001);
        assert!(parse_word("0xZZ").is_err());
        assert!(parse_word("-1").is_err());
    }

    #[test]
    fn test_encode_decode_agree() {
        let word = encode(12, 3, 7, 2, true).unwrap();
        let decoded = parse_word(&word.to_string()).unwrap();
        assert_eq!(decoded, word);
        assert!(describe(decoded).contains("priority:     7"));
        assert!(describe(decoded).contains("data_version: 12"));
    }

    #[test]
    fn test_encode_rejects_out_of_range_fields() {
        assert!(encode(MAX_DATA_VERSION + 1, 0, 0, 0, false).is_err());
        assert!(encode(0, MAX_EPOCH + 1, 0, 0, false).is_err());
        assert!(encode(0, 0, 16, 0, false).is_err());
        assert!(encode(0, 0, 0, MAX_REF_COUNT + 1, false).is_err());
    }
}
