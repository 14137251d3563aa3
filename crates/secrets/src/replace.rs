//! Literal text substitution driven by base64 argument pairs
//!
//! This is the engine behind the bundled `tether-replace` executable, the
//! fallback filter command on hosts without a usable `sed`. Arguments come in
//! `(from, to)` pairs, each base64 encoded so arbitrary secret bytes survive
//! shell quoting.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tether_core::{Error, Result};

/// Encode one argument for the replace tool command line
#[must_use]
pub fn encode_arg(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decode `(from, to)` pairs from command line arguments
///
/// # Errors
///
/// Returns a `Config` error for an odd argument count, invalid base64 or
/// non-UTF-8 payloads.
pub fn decode_pairs<S: AsRef<str>>(args: &[S]) -> Result<Vec<(String, String)>> {
    if args.len() % 2 != 0 {
        return Err(Error::Config(format!(
            "Expected (from, to) argument pairs, got {} arguments",
            args.len()
        )));
    }

    args.chunks(2)
        .map(|pair| Ok((decode_arg(pair[0].as_ref())?, decode_arg(pair[1].as_ref())?)))
        .collect()
}

fn decode_arg(arg: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(arg)
        .map_err(|e| Error::Config(format!("Invalid base64 argument '{arg}': {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Config(format!("Argument '{arg}' is not valid UTF-8: {e}")))
}

/// Apply every pair in order; empty `from` strings are skipped
#[must_use]
pub fn apply_pairs(input: &str, pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .filter(|(from, _)| !from.is_empty())
        .fold(input.to_string(), |acc, (from, to)| acc.replace(from, to))
}
