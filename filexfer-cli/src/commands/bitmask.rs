//! Ready-part bitmask inspection.
//!
//! Partial download records store readiness as an encoded bitmask; these
//! commands turn part lists into that encoding and back.

use clap::Subcommand;
use filexfer::Bitmask;

use crate::error::CliError;

#[derive(Debug, Subcommand)]
pub enum BitmaskAction {
    /// Encode a list of ready part indices
    Encode {
        /// Ready part indices
        #[arg(required = true)]
        parts: Vec<usize>,
    },
    /// Decode a hex-encoded bitmask
    Decode {
        /// Encoded bitmask as hex
        hex: String,
        /// Part size in bytes, to report sizes
        #[arg(long)]
        part_size: Option<i64>,
        /// File size in bytes, 0 if unknown
        #[arg(long, default_value_t = 0)]
        size: i64,
    },
}

/// What a decoded bitmask says about a transfer.
#[derive(Debug, PartialEq)]
pub struct Summary {
    pub ready_parts: Vec<usize>,
    pub prefix_parts: usize,
    /// `(ready prefix bytes, total ready bytes)` when a part size is known.
    pub sizes: Option<(i64, i64)>,
}

pub fn run(action: BitmaskAction) -> Result<(), CliError> {
    match action {
        BitmaskAction::Encode { parts } => {
            println!("{}", encode(&parts));
            Ok(())
        }
        BitmaskAction::Decode {
            hex,
            part_size,
            size,
        } => {
            let summary = decode(&hex, part_size, size)?;
            println!("Ready parts:  {}", summary.ready_parts.len());
            println!("Prefix parts: {}", summary.prefix_parts);
            if let Some((prefix, total)) = summary.sizes {
                println!("Prefix bytes: {prefix}");
                println!("Ready bytes:  {total}");
            }
            println!("Parts:        {:?}", summary.ready_parts);
            Ok(())
        }
    }
}

pub fn encode(parts: &[usize]) -> String {
    let mut bitmask = Bitmask::new();
    for &part in parts {
        bitmask.set(part);
    }
    hex::encode(bitmask.encode(None))
}

pub fn decode(encoded: &str, part_size: Option<i64>, size: i64) -> Result<Summary, CliError> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| CliError::Usage(format!("bitmask is not valid hex: {e}")))?;
    let bitmask = Bitmask::decode(&bytes);

    let sizes = match part_size {
        Some(part_size) if part_size <= 0 => {
            return Err(CliError::Usage(format!(
                "part size must be positive, got {part_size}"
            )))
        }
        Some(part_size) => Some((
            bitmask.get_ready_prefix_size(0, part_size, size),
            bitmask.get_total_size(part_size, size),
        )),
        None => None,
    };

    Ok(Summary {
        ready_parts: bitmask.as_vector(),
        prefix_parts: bitmask.get_ready_parts(0),
        sizes,
    })
}
